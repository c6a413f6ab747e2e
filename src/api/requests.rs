//! Request bodies for the generation endpoints and their conversion into
//! job descriptors

use axum::body::Bytes;
use axum::extract::Multipart;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::queue::job::{
    GenerationParams, JobDescriptor, JobKind, Lora, OutpaintDirection, SeedPolicy, UovMethod,
};
use crate::response::codec;

/// Multipart fields carrying image bytes rather than text
const FILE_FIELDS: &[&str] = &["input_image", "input_mask"];

/// Text-to-image request, also the common part of the form endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Text2ImgRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub style_selections: Vec<String>,
    pub performance_selection: String,
    pub aspect_ratios_selection: String,
    pub image_number: u32,
    /// Negative for a random seed
    pub image_seed: i64,
    pub sharpness: f32,
    pub guidance_scale: f32,
    pub base_model_name: String,
    pub refiner_model_name: String,
    pub loras: Vec<Lora>,
}

impl Default for Text2ImgRequest {
    fn default() -> Self {
        let params = GenerationParams::default();
        Self {
            prompt: params.prompt,
            negative_prompt: params.negative_prompt,
            style_selections: params.style_selections,
            performance_selection: params.performance.as_str().to_string(),
            aspect_ratios_selection: params.aspect_ratio.to_string(),
            image_number: params.image_number,
            image_seed: -1,
            sharpness: params.sharpness,
            guidance_scale: params.guidance_scale,
            base_model_name: params.base_model_name,
            refiner_model_name: params.refiner_model_name,
            loras: params.loras,
        }
    }
}

impl Text2ImgRequest {
    pub fn into_params(self) -> Result<GenerationParams> {
        Ok(GenerationParams {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            style_selections: self.style_selections,
            performance: self.performance_selection.parse()?,
            aspect_ratio: self.aspect_ratios_selection.parse()?,
            image_number: self.image_number,
            seed: SeedPolicy::from_wire(self.image_seed),
            sharpness: self.sharpness,
            guidance_scale: self.guidance_scale,
            base_model_name: self.base_model_name,
            refiner_model_name: self.refiner_model_name,
            loras: self.loras,
        })
    }

    pub fn into_job(self, streaming: bool) -> Result<JobDescriptor> {
        JobDescriptor::new(JobKind::TextToImage, self.into_params()?, streaming)
    }

    /// Read the common fields of a multipart form, falling back to defaults
    pub fn from_form(form: &FormFields) -> Result<Self> {
        let defaults = Self::default();

        let text_or = |name: &str, default: String| {
            form.text(name).map(str::to_string).unwrap_or(default)
        };

        let style_selections = if form.contains("style_selections") {
            form.list("style_selections")
        } else {
            defaults.style_selections
        };

        let loras = match form.text("loras") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                AppError::InvalidRequest(format!("loras must be a JSON array: {}", e))
            })?,
            None => defaults.loras,
        };

        Ok(Self {
            prompt: text_or("prompt", defaults.prompt),
            negative_prompt: text_or("negative_prompt", defaults.negative_prompt),
            style_selections,
            performance_selection: text_or("performance_selection", defaults.performance_selection),
            aspect_ratios_selection: text_or(
                "aspect_ratios_selection",
                defaults.aspect_ratios_selection,
            ),
            image_number: form.parse("image_number")?.unwrap_or(defaults.image_number),
            image_seed: form.parse("image_seed")?.unwrap_or(defaults.image_seed),
            sharpness: form.parse("sharpness")?.unwrap_or(defaults.sharpness),
            guidance_scale: form.parse("guidance_scale")?.unwrap_or(defaults.guidance_scale),
            base_model_name: text_or("base_model_name", defaults.base_model_name),
            refiner_model_name: text_or("refiner_model_name", defaults.refiner_model_name),
            loras,
        })
    }
}

/// Image upscale or variation request (multipart form)
#[derive(Debug, Clone)]
pub struct ImgUpscaleOrVaryRequest {
    pub common: Text2ImgRequest,
    pub input_image: image::RgbImage,
    pub uov_method: UovMethod,
}

impl ImgUpscaleOrVaryRequest {
    pub fn from_form(form: &FormFields) -> Result<Self> {
        Ok(Self {
            common: Text2ImgRequest::from_form(form)?,
            input_image: codec::decode_rgb("input_image", form.required_file("input_image")?)?,
            uov_method: form.parse("uov_method")?.unwrap_or_default(),
        })
    }

    pub fn into_job(self, streaming: bool) -> Result<JobDescriptor> {
        let kind = JobKind::UpscaleOrVary {
            input_image: Arc::new(self.input_image),
            method: self.uov_method,
        };
        JobDescriptor::new(kind, self.common.into_params()?, streaming)
    }
}

/// Inpaint or outpaint request (multipart form)
#[derive(Debug, Clone)]
pub struct ImgInpaintOrOutpaintRequest {
    pub common: Text2ImgRequest,
    pub input_image: image::RgbImage,
    pub input_mask: Option<image::GrayImage>,
    pub outpaint_selections: Vec<OutpaintDirection>,
    pub inpaint_strength: f32,
}

impl ImgInpaintOrOutpaintRequest {
    pub fn from_form(form: &FormFields) -> Result<Self> {
        let input_mask = form
            .file("input_mask")
            .filter(|data| !data.is_empty())
            .map(|data| codec::decode_mask("input_mask", data))
            .transpose()?;

        let outpaint_selections = form
            .list("outpaint_selections")
            .iter()
            .map(|value| value.parse())
            .collect::<Result<Vec<OutpaintDirection>>>()?;

        Ok(Self {
            common: Text2ImgRequest::from_form(form)?,
            input_image: codec::decode_rgb("input_image", form.required_file("input_image")?)?,
            input_mask,
            outpaint_selections,
            inpaint_strength: form.parse("inpaint_strength")?.unwrap_or(1.0),
        })
    }

    pub fn into_job(self, streaming: bool) -> Result<JobDescriptor> {
        let kind = JobKind::InpaintOrOutpaint {
            input_image: Arc::new(self.input_image),
            mask: self.input_mask.map(Arc::new),
            outpaint: self.outpaint_selections,
            strength: self.inpaint_strength,
        };
        JobDescriptor::new(kind, self.common.into_params()?, streaming)
    }
}

/// Collected multipart form: text values by name, file contents by name
#[derive(Debug, Default, Clone)]
pub struct FormFields {
    text: HashMap<String, Vec<String>>,
    files: HashMap<String, Bytes>,
}

impl FormFields {
    pub async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut form = Self::default();

        while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };

            if FILE_FIELDS.contains(&name.as_str()) {
                let data = field.bytes().await.map_err(bad_form)?;
                form.files.insert(name, data);
            } else {
                let value = field.text().await.map_err(bad_form)?;
                form.text.entry(name).or_default().push(value);
            }
        }

        Ok(form)
    }

    pub fn with_text(mut self, name: &str, value: &str) -> Self {
        self.text
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_file(mut self, name: &str, data: impl Into<Bytes>) -> Self {
        self.files.insert(name.to_string(), data.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.text.contains_key(name)
    }

    /// First non-empty value of a text field
    pub fn text(&self, name: &str) -> Option<&str> {
        self.text
            .get(name)?
            .iter()
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
    }

    /// All values of a repeated field, each also split on commas
    pub fn list(&self, name: &str) -> Vec<String> {
        self.text
            .get(name)
            .into_iter()
            .flatten()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.text(name)
            .map(|value| {
                value.parse().map_err(|e| {
                    AppError::InvalidRequest(format!("Invalid value for {}: {}", name, e))
                })
            })
            .transpose()
    }

    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(|data| data.as_ref())
    }

    pub fn required_file(&self, name: &str) -> Result<&[u8]> {
        self.file(name)
            .ok_or_else(|| AppError::InvalidRequest(format!("Missing file field '{}'", name)))
    }
}

fn bad_form(e: axum::extract::multipart::MultipartError) -> AppError {
    AppError::InvalidRequest(format!("Malformed multipart body: {}", e))
}
