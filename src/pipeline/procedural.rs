//! Deterministic procedural pipeline
//!
//! Stands in for the GPU-resident diffusion model. Output depends only on the
//! job parameters and the resolved seed, so identical inputs reproduce
//! identical pixels.

use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::pipeline::{GenerationContext, GenerationPipeline, PipelineError};
use crate::queue::job::{GenerationParams, JobDescriptor, JobKind, OutpaintDirection, UovMethod};

/// Fraction of the source edge added per outpaint direction
const OUTPAINT_RATIO: f32 = 0.3;

/// Mask values above this are repainted
const MASK_THRESHOLD: u8 = 127;

pub struct ProceduralPipeline {
    step_delay: Duration,
    loaded: bool,
}

impl ProceduralPipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            step_delay: Duration::from_millis(config.step_delay_ms),
            loaded: false,
        }
    }

    fn load(&mut self) {
        if !self.loaded {
            self.loaded = true;
            info!("Procedural pipeline loaded");
        }
    }

    /// Render one image synchronously
    pub fn render(job: &JobDescriptor, seed: u64) -> Result<RgbImage, PipelineError> {
        RenderSpec::new(job, seed).render()
    }
}

#[async_trait]
impl GenerationPipeline for ProceduralPipeline {
    fn name(&self) -> &str {
        "procedural"
    }

    async fn preload(&mut self) -> Result<(), PipelineError> {
        self.load();
        Ok(())
    }

    async fn generate(
        &mut self,
        job: &JobDescriptor,
        ctx: &mut GenerationContext<'_>,
    ) -> Result<(), PipelineError> {
        self.load();

        let steps = job.params().performance.steps();
        debug!(
            job_id = %job.id(),
            kind = job.kind().name(),
            performance = job.params().performance.as_str(),
            steps,
            images = ctx.requested(),
            "Starting procedural generation"
        );

        for index in 0..ctx.requested() {
            let seed = ctx.seed_for(index);

            for _ in 0..steps {
                ctx.checkpoint()?;
                if !self.step_delay.is_zero() {
                    tokio::time::sleep(self.step_delay).await;
                }
            }

            let spec = RenderSpec::new(job, seed);
            let image = tokio::task::spawn_blocking(move || spec.render())
                .await
                .map_err(|e| PipelineError::Model(format!("render task failed: {}", e)))??;

            ctx.emit(image)?;
            debug!(job_id = %job.id(), index, seed, "Image finished");
        }

        Ok(())
    }
}

/// Owned render inputs so rendering can move onto the blocking pool
struct RenderSpec {
    width: u32,
    height: u32,
    pattern_seed: u64,
    contrast: f32,
    operation: Operation,
}

enum Operation {
    Generate,
    Resize {
        source: Arc<RgbImage>,
        scale: f32,
        filter: FilterType,
    },
    Vary {
        source: Arc<RgbImage>,
        amount: f32,
    },
    Inpaint {
        source: Arc<RgbImage>,
        mask: Option<Arc<GrayImage>>,
        outpaint: Vec<OutpaintDirection>,
        strength: f32,
    },
}

impl RenderSpec {
    fn new(job: &JobDescriptor, seed: u64) -> Self {
        let params = job.params();
        let operation = match job.kind() {
            JobKind::TextToImage => Operation::Generate,
            JobKind::UpscaleOrVary {
                input_image,
                method,
            } => {
                debug!(method = method.as_str(), "Upscale or vary");
                let source = input_image.clone();
                match method {
                    UovMethod::Disabled => Operation::Generate,
                    UovMethod::VarySubtle => Operation::Vary {
                        source,
                        amount: 0.5,
                    },
                    UovMethod::VaryStrong => Operation::Vary {
                        source,
                        amount: 0.85,
                    },
                    UovMethod::Upscale15 => Operation::Resize {
                        source,
                        scale: 1.5,
                        filter: FilterType::CatmullRom,
                    },
                    UovMethod::Upscale2 => Operation::Resize {
                        source,
                        scale: 2.0,
                        filter: FilterType::Lanczos3,
                    },
                    UovMethod::UpscaleFast2 => Operation::Resize {
                        source,
                        scale: 2.0,
                        filter: FilterType::Triangle,
                    },
                }
            }
            JobKind::InpaintOrOutpaint {
                input_image,
                mask,
                outpaint,
                strength,
            } => Operation::Inpaint {
                source: input_image.clone(),
                mask: mask.clone(),
                outpaint: outpaint.clone(),
                strength: *strength,
            },
        };

        Self {
            width: params.aspect_ratio.width,
            height: params.aspect_ratio.height,
            pattern_seed: seed ^ fingerprint(params),
            contrast: (params.guidance_scale / 7.0).clamp(0.2, 3.0),
            operation,
        }
    }

    fn render(self) -> Result<RgbImage, PipelineError> {
        match &self.operation {
            Operation::Generate => Ok(self.pattern(self.width, self.height)),
            Operation::Resize {
                source,
                scale,
                filter,
            } => {
                let (w, h) = non_empty(source)?;
                let width = (w as f32 * scale).round() as u32;
                let height = (h as f32 * scale).round() as u32;
                Ok(imageops::resize(&**source, width, height, *filter))
            }
            Operation::Vary { source, amount } => {
                let (w, h) = non_empty(source)?;
                let noise = self.pattern(w, h);
                Ok(RgbImage::from_fn(w, h, |x, y| {
                    blend(source.get_pixel(x, y), noise.get_pixel(x, y), *amount)
                }))
            }
            Operation::Inpaint {
                source,
                mask,
                outpaint,
                strength,
            } => {
                let (w, h) = non_empty(source)?;
                let pad = |dir: OutpaintDirection, edge: u32| {
                    if outpaint.contains(&dir) {
                        (edge as f32 * OUTPAINT_RATIO) as u32
                    } else {
                        0
                    }
                };
                let left = pad(OutpaintDirection::Left, w);
                let right = pad(OutpaintDirection::Right, w);
                let top = pad(OutpaintDirection::Top, h);
                let bottom = pad(OutpaintDirection::Bottom, h);

                let fill = self.pattern(w + left + right, h + top + bottom);
                let mut canvas = fill.clone();
                imageops::replace(&mut canvas, &**source, left as i64, top as i64);

                if let Some(mask) = mask {
                    for (x, y, value) in mask.enumerate_pixels() {
                        if value.0[0] > MASK_THRESHOLD {
                            let (cx, cy) = (x + left, y + top);
                            let repainted =
                                blend(source.get_pixel(x, y), fill.get_pixel(cx, cy), *strength);
                            canvas.put_pixel(cx, cy, repainted);
                        }
                    }
                }

                Ok(canvas)
            }
        }
    }

    /// Smooth seeded two-colour interference pattern
    fn pattern(&self, width: u32, height: u32) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(self.pattern_seed);
        let base: [f32; 3] = [rng.gen(), rng.gen(), rng.gen()];
        let accent: [f32; 3] = [rng.gen(), rng.gen(), rng.gen()];
        let fx: f32 = rng.gen_range(1.0..12.0);
        let fy: f32 = rng.gen_range(1.0..12.0);
        let phase: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
        let contrast = self.contrast;

        RgbImage::from_fn(width, height, |x, y| {
            let u = x as f32 / width.max(1) as f32;
            let v = y as f32 / height.max(1) as f32;
            let wave = (u * fx + phase).sin() * (v * fy - phase).cos() * 0.5 + 0.5;
            let t = (0.5 + (wave - 0.5) * contrast).clamp(0.0, 1.0);
            Rgb(std::array::from_fn(|c| {
                ((base[c] + (accent[c] - base[c]) * t) * 255.0).round() as u8
            }))
        })
    }
}

fn non_empty(source: &RgbImage) -> Result<(u32, u32), PipelineError> {
    let (w, h) = source.dimensions();
    if w == 0 || h == 0 {
        return Err(PipelineError::InvalidInput("input image is empty".to_string()));
    }
    Ok((w, h))
}

fn blend(a: &Rgb<u8>, b: &Rgb<u8>, amount: f32) -> Rgb<u8> {
    Rgb(std::array::from_fn(|c| {
        (a.0[c] as f32 * (1.0 - amount) + b.0[c] as f32 * amount).round() as u8
    }))
}

/// FNV-1a over everything that conditions the output besides the seed
fn fingerprint(params: &GenerationParams) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
        // field separator
        hash ^= 0xff;
        hash = hash.wrapping_mul(PRIME);
    };

    feed(params.prompt.as_bytes());
    feed(params.negative_prompt.as_bytes());
    for style in &params.style_selections {
        feed(style.as_bytes());
    }
    feed(params.base_model_name.as_bytes());
    feed(params.refiner_model_name.as_bytes());
    for lora in &params.loras {
        feed(lora.model_name.as_bytes());
        feed(&lora.weight.to_le_bytes()[..]);
    }
    feed(&params.sharpness.to_le_bytes()[..]);

    hash
}
