//! Job descriptors: immutable, validated generation requests

use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Identifier assigned to every job at construction time
pub type JobId = Uuid;

/// Largest seed the pipeline accepts; seeds wrap modulo `MAX_SEED + 1`
pub const MAX_SEED: u64 = i64::MAX as u64;

/// Upper bound for `image_number`
pub const MAX_IMAGE_NUMBER: u32 = 32;

/// SDXL resolutions the pipeline was trained on
pub const AVAILABLE_ASPECT_RATIOS: &[(u32, u32)] = &[
    (704, 1408),
    (704, 1344),
    (768, 1344),
    (768, 1280),
    (832, 1216),
    (832, 1152),
    (896, 1152),
    (896, 1088),
    (960, 1088),
    (960, 1024),
    (1024, 1024),
    (1024, 960),
    (1088, 960),
    (1088, 896),
    (1152, 896),
    (1152, 832),
    (1216, 832),
    (1280, 768),
    (1344, 768),
    (1344, 704),
    (1408, 704),
    (1472, 704),
    (1536, 640),
    (1600, 640),
    (1664, 576),
    (1728, 576),
];

/// Sampling preset; each maps to a fixed number of denoising steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Performance {
    #[default]
    Speed,
    Quality,
    ExtremeSpeed,
}

impl Performance {
    pub fn steps(self) -> u32 {
        match self {
            Performance::Speed => 30,
            Performance::Quality => 60,
            Performance::ExtremeSpeed => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Performance::Speed => "Speed",
            Performance::Quality => "Quality",
            Performance::ExtremeSpeed => "Extreme Speed",
        }
    }
}

impl FromStr for Performance {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Speed" => Ok(Performance::Speed),
            "Quality" => Ok(Performance::Quality),
            "Extreme Speed" => Ok(Performance::ExtremeSpeed),
            other => Err(AppError::InvalidRequest(format!(
                "Unknown performance_selection '{}'",
                other
            ))),
        }
    }
}

/// Output resolution selected from [`AVAILABLE_ASPECT_RATIOS`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self {
            width: 1152,
            height: 896,
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = AppError;

    /// Accepts `1152×896`, `1152x896` and `1152*896`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || AppError::InvalidRequest(format!("Invalid aspect_ratios_selection '{}'", s));

        let (width, height) = s
            .trim()
            .split_once(|c: char| c == '×' || c == 'x' || c == '*')
            .ok_or_else(invalid)?;
        let width: u32 = width.trim().parse().map_err(|_| invalid())?;
        let height: u32 = height.trim().parse().map_err(|_| invalid())?;

        if !AVAILABLE_ASPECT_RATIOS.contains(&(width, height)) {
            return Err(AppError::InvalidRequest(format!(
                "Unsupported aspect ratio {}×{}",
                width, height
            )));
        }

        Ok(Self { width, height })
    }
}

/// How the seed of a job is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    Random,
    Fixed(u64),
}

impl SeedPolicy {
    /// Negative wire values request a random seed
    pub fn from_wire(seed: i64) -> Self {
        if seed < 0 {
            SeedPolicy::Random
        } else {
            SeedPolicy::Fixed(seed as u64)
        }
    }

    /// Resolve to the concrete base seed used for generation
    pub fn resolve<R: Rng>(self, rng: &mut R) -> u64 {
        match self {
            SeedPolicy::Random => rng.gen_range(0..=MAX_SEED),
            SeedPolicy::Fixed(seed) => seed & MAX_SEED,
        }
    }
}

/// LoRA adapter applied on top of the base model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lora {
    pub model_name: String,
    #[serde(default = "default_lora_weight")]
    pub weight: f32,
}

fn default_lora_weight() -> f32 {
    0.5
}

/// Upscale or variation mode for image-upscale-vary jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UovMethod {
    #[default]
    Disabled,
    VarySubtle,
    VaryStrong,
    Upscale15,
    Upscale2,
    UpscaleFast2,
}

impl UovMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            UovMethod::Disabled => "Disabled",
            UovMethod::VarySubtle => "Vary (Subtle)",
            UovMethod::VaryStrong => "Vary (Strong)",
            UovMethod::Upscale15 => "Upscale (1.5x)",
            UovMethod::Upscale2 => "Upscale (2x)",
            UovMethod::UpscaleFast2 => "Upscale (Fast 2x)",
        }
    }
}

impl FromStr for UovMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let method = match s.trim() {
            "Disabled" => UovMethod::Disabled,
            "Vary (Subtle)" => UovMethod::VarySubtle,
            "Vary (Strong)" => UovMethod::VaryStrong,
            "Upscale (1.5x)" => UovMethod::Upscale15,
            "Upscale (2x)" => UovMethod::Upscale2,
            "Upscale (Fast 2x)" => UovMethod::UpscaleFast2,
            other => {
                return Err(AppError::InvalidRequest(format!("Unknown uov_method '{}'", other)))
            }
        };
        Ok(method)
    }
}

/// Side of the canvas to extend when outpainting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutpaintDirection {
    Left,
    Right,
    Top,
    Bottom,
}

impl FromStr for OutpaintDirection {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "Left" => Ok(OutpaintDirection::Left),
            "Right" => Ok(OutpaintDirection::Right),
            "Top" => Ok(OutpaintDirection::Top),
            "Bottom" => Ok(OutpaintDirection::Bottom),
            other => Err(AppError::InvalidRequest(format!(
                "Unknown outpaint selection '{}'",
                other
            ))),
        }
    }
}

/// Parameters shared by every kind of generation job
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub style_selections: Vec<String>,
    pub performance: Performance,
    pub aspect_ratio: AspectRatio,
    pub image_number: u32,
    pub seed: SeedPolicy,
    pub sharpness: f32,
    pub guidance_scale: f32,
    pub base_model_name: String,
    pub refiner_model_name: String,
    pub loras: Vec<Lora>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            style_selections: vec![
                "Fooocus V2".to_string(),
                "Default (Slightly Cinematic)".to_string(),
            ],
            performance: Performance::Speed,
            aspect_ratio: AspectRatio::default(),
            image_number: 1,
            seed: SeedPolicy::Random,
            sharpness: 2.0,
            guidance_scale: 7.0,
            base_model_name: "sd_xl_base_1.0_0.9vae.safetensors".to_string(),
            refiner_model_name: "sd_xl_refiner_1.0_0.9vae.safetensors".to_string(),
            loras: vec![Lora {
                model_name: "sd_xl_offset_example-lora_1.0.safetensors".to_string(),
                weight: 0.5,
            }],
        }
    }
}

impl GenerationParams {
    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.image_number == 0 || self.image_number > MAX_IMAGE_NUMBER {
            return Err(AppError::InvalidRequest(format!(
                "image_number must be between 1 and {}",
                MAX_IMAGE_NUMBER
            )));
        }
        if !(0.0..=30.0).contains(&self.sharpness) {
            return Err(AppError::InvalidRequest(
                "sharpness must be between 0 and 30".to_string(),
            ));
        }
        if !(1.0..=30.0).contains(&self.guidance_scale) {
            return Err(AppError::InvalidRequest(
                "guidance_scale must be between 1 and 30".to_string(),
            ));
        }
        for lora in &self.loras {
            if !(-2.0..=2.0).contains(&lora.weight) {
                return Err(AppError::InvalidRequest(format!(
                    "LoRA '{}' weight must be between -2 and 2",
                    lora.model_name
                )));
            }
        }
        Ok(())
    }
}

/// Kind-specific inputs of a job
#[derive(Debug, Clone)]
pub enum JobKind {
    TextToImage,
    UpscaleOrVary {
        input_image: Arc<RgbImage>,
        method: UovMethod,
    },
    InpaintOrOutpaint {
        input_image: Arc<RgbImage>,
        mask: Option<Arc<GrayImage>>,
        outpaint: Vec<OutpaintDirection>,
        strength: f32,
    },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::TextToImage => "text-to-image",
            JobKind::UpscaleOrVary { .. } => "image-upscale-vary",
            JobKind::InpaintOrOutpaint { .. } => "image-inpaint-outpaint",
        }
    }

    fn validate(&self) -> Result<()> {
        if let JobKind::InpaintOrOutpaint {
            input_image,
            mask,
            outpaint,
            strength,
        } = self
        {
            if !(0.0..=1.0).contains(strength) {
                return Err(AppError::InvalidRequest(
                    "inpaint_strength must be between 0 and 1".to_string(),
                ));
            }
            match mask {
                Some(mask) if mask.dimensions() != input_image.dimensions() => {
                    return Err(AppError::InvalidRequest(format!(
                        "input_mask is {}x{} but input_image is {}x{}",
                        mask.width(),
                        mask.height(),
                        input_image.width(),
                        input_image.height()
                    )));
                }
                None if outpaint.is_empty() => {
                    return Err(AppError::InvalidRequest(
                        "Inpaint requires input_mask or at least one outpaint_selections entry"
                            .to_string(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Immutable description of one generation request
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    id: JobId,
    kind: JobKind,
    params: GenerationParams,
    streaming: bool,
    received_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Validate and freeze a request.
    ///
    /// Streaming responses carry exactly one image, so `image_number` is
    /// forced to 1 when `streaming` is set.
    pub fn new(kind: JobKind, mut params: GenerationParams, streaming: bool) -> Result<Self> {
        if streaming {
            params.image_number = 1;
        }
        params.validate()?;
        kind.validate()?;

        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            params,
            streaming,
            received_at: Utc::now(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn image_number(&self) -> u32 {
        self.params.image_number
    }

    pub fn streaming(&self) -> bool {
        self.streaming
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
