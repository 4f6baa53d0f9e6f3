use std::{fmt, path::Path, str::FromStr, time::Instant};

use anyhow::{bail, ensure, Context, Result};
use candle_core::{safetensors::MmapedSafetensors, DType, Device, IndexOp, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::{debug, info, warn};

mod hub;
mod text;

use crate::{
    select_best_device,
    util::{image_to_tensor, mask_to_tensor, open_image, target_dims, tensor_to_image},
    Conditioning, DeviceMap, GenerationRequest, LoadOptions, Loader, Mode, ModelLike, ModelVariant,
};
use hub::Hub;
use text::TextEncoder;

const CLIP_TOKENIZER: &str = "openai/clip-vit-base-patch32";
const CLIP_L_TOKENIZER: &str = "openai/clip-vit-large-patch14";
const CLIP_G_TOKENIZER: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
const SDXL_FP16_VAE: &str = "madebyollin/sdxl-vae-fp16-fix";

/// UNet input channels of dedicated inpainting checkpoints: latents, mask and masked image.
const INPAINT_UNET_CHANNELS: usize = 9;

/// Stable Diffusion model family. Decides the network configuration, the text encoders and the
/// latent scaling factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SdVersion {
    V1_5,
    V2_1,
    Xl,
    Turbo,
}

impl SdVersion {
    /// Detect the family from a model identifier, defaulting to 1.5 (the base of most fine-tunes).
    pub fn from_name(model_name: &str) -> Self {
        let name = model_name.to_lowercase();
        if name.contains("xl") && name.contains("turbo") {
            SdVersion::Turbo
        } else if name.contains("xl") {
            SdVersion::Xl
        } else if name.contains("2-1") || name.contains("2.1") || name.contains("v2") {
            SdVersion::V2_1
        } else {
            SdVersion::V1_5
        }
    }

    fn config(self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            SdVersion::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            SdVersion::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
            SdVersion::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, None, None),
            SdVersion::Turbo => {
                StableDiffusionConfig::sdxl_turbo(sliced_attention_size, None, None)
            }
        }
    }

    fn vae_scale(self) -> f64 {
        match self {
            SdVersion::V1_5 | SdVersion::V2_1 => 0.18215,
            SdVersion::Xl | SdVersion::Turbo => 0.13025,
        }
    }

    fn is_xl(self) -> bool {
        matches!(self, SdVersion::Xl | SdVersion::Turbo)
    }

    fn tokenizer_repo(self) -> &'static str {
        if self.is_xl() {
            CLIP_L_TOKENIZER
        } else {
            CLIP_TOKENIZER
        }
    }
}

impl fmt::Display for SdVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SdVersion::V1_5 => "v1-5",
            SdVersion::V2_1 => "v2-1",
            SdVersion::Xl => "xl",
            SdVersion::Turbo => "turbo",
        };
        f.write_str(name)
    }
}

impl FromStr for SdVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v1-5" | "1.5" | "v1_5" => Ok(SdVersion::V1_5),
            "v2-1" | "2.1" | "v2_1" => Ok(SdVersion::V2_1),
            "xl" | "sdxl" => Ok(SdVersion::Xl),
            "turbo" | "sdxl-turbo" => Ok(SdVersion::Turbo),
            other => Err(format!(
                "unknown stable diffusion version `{other}`, expected v1-5, v2-1, xl or turbo"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SdVariant {
    /// Hub repository id, or a local directory in the diffusers layout.
    pub model_id: String,
    pub version: SdVersion,
    pub mode: Mode,
}

/// Timestep index img2img denoising starts from: a strength of 1 runs every step, 0 none.
fn img2img_start(steps: usize, strength: f64) -> usize {
    let strength = strength.clamp(0.0, 1.0);
    steps - (steps as f64 * strength) as usize
}

/// Input channels of a UNet checkpoint, read from the shape of its first convolution.
fn unet_in_channels(weights: &Path) -> Result<usize> {
    let tensors = unsafe { MmapedSafetensors::new(weights)? };
    let conv_in = tensors
        .get("conv_in.weight")
        .with_context(|| format!("no conv_in.weight in {}", weights.display()))?;
    match conv_in.shape() {
        [_, channels, _, _] => Ok(*channels),
        shape => bail!("unexpected conv_in.weight shape {shape:?}"),
    }
}

/// `mask` selects `latents` (1, repaint) or `original` (0, keep).
fn blend(mask: &Tensor, latents: &Tensor, original: &Tensor) -> Result<Tensor> {
    let keep = mask.affine(-1., 1.)?;
    Ok((mask.broadcast_mul(latents)? + keep.broadcast_mul(original)?)?)
}

enum Inpainting {
    /// Inpainting checkpoints take the mask and the masked image latents as extra UNet input.
    Channels { mask: Tensor, masked_image: Tensor },
    /// Other checkpoints denoise the whole image and get the kept area back from the initial
    /// latents, noised to the current timestep.
    Blend {
        mask: Tensor,
        init_latents: Tensor,
        noise: Tensor,
    },
}

pub struct SdModel {
    device: Device,
    dtype: DType,
    version: SdVersion,
    mode: Mode,
    unet_in_channels: usize,
    config: StableDiffusionConfig,
    encoders: Vec<TextEncoder>,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl SdModel {
    fn text_embeddings(&self, request: &GenerationRequest, use_guidance: bool) -> Result<Tensor> {
        let negative = request.negative_prompt.as_deref().unwrap_or("");
        let embeddings = self
            .encoders
            .iter()
            .map(|encoder| {
                encoder.encode(&request.prompt, negative, use_guidance, &self.device, self.dtype)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&embeddings, D::Minus1)?)
    }

    /// Standard normal latents for an image of `width` x `height`, drawn from `rng` so a seed
    /// gives the same noise on every device.
    fn noise(&self, rng: &mut StdRng, width: usize, height: usize) -> Result<Tensor> {
        let shape = (1, 4, height / 8, width / 8);
        let len = 4 * (height / 8) * (width / 8);
        let values: Vec<f32> = (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        Ok(Tensor::from_vec(values, shape, &self.device)?.to_dtype(self.dtype)?)
    }

    fn encode_image(&self, image: &Tensor) -> Result<Tensor> {
        let latents = self.vae.encode(&image.to_dtype(self.dtype)?)?.sample()?;
        Ok((latents * self.version.vae_scale())?)
    }

    fn decode_latents(&self, latents: &Tensor) -> Result<DynamicImage> {
        let image = self.vae.decode(&(latents / self.version.vae_scale())?)?;
        let image = ((image.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

impl ModelLike for SdModel {
    fn run(&self, request: GenerationRequest) -> Result<DynamicImage> {
        ensure!(
            request.conditioning.mode() == self.mode,
            "{} request sent to a model loaded for {}",
            request.conditioning.mode(),
            self.mode
        );
        ensure!(request.steps > 0, "the number of inference steps must be positive");

        let started = Instant::now();
        let use_guidance = request.guidance_scale > 1.0;
        if !self.device.is_cpu() {
            self.device.set_seed(request.seed)?;
        }
        let mut rng = StdRng::seed_from_u64(request.seed);

        let text_embeddings = self.text_embeddings(&request, use_guidance)?;
        let mut scheduler = self.config.build_scheduler(request.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let (mut latents, t_start, inpaint) = match &request.conditioning {
            Conditioning::TextToImage => {
                let width = request.width.unwrap_or(self.config.width);
                let height = request.height.unwrap_or(self.config.height);
                ensure!(
                    width % 8 == 0 && height % 8 == 0,
                    "width and height must be multiples of 8, got {width}x{height}"
                );
                let noise = self.noise(&mut rng, width, height)?;
                ((noise * scheduler.init_noise_sigma())?, 0, None)
            }
            Conditioning::ImageToImage {
                init_image,
                strength,
            } => {
                let image = open_image(init_image)?;
                let (width, height) = target_dims(&image, request.width, request.height);
                let image = image_to_tensor(&image, width, height, &self.device)?;
                let latents = self.encode_image(&image)?;
                let t_start = img2img_start(request.steps, *strength);
                let latents = match timesteps.get(t_start) {
                    Some(&timestep) => {
                        let noise = self.noise(&mut rng, width, height)?;
                        scheduler.add_noise(&latents, noise, timestep)?
                    }
                    None => latents,
                };
                (latents, t_start, None)
            }
            Conditioning::Inpaint { init_image, mask } => {
                let image = open_image(init_image)?;
                let mask = open_image(mask)?;
                let (width, height) = target_dims(&image, request.width, request.height);
                let image = image_to_tensor(&image, width, height, &self.device)?;
                let mask = mask_to_tensor(&mask, width, height, &self.device)?;
                let latent_mask = mask
                    .upsample_nearest2d(height / 8, width / 8)?
                    .to_dtype(self.dtype)?;

                let noise = self.noise(&mut rng, width, height)?;
                let latents = noise.affine(scheduler.init_noise_sigma(), 0.)?;
                let inpaint = if self.unet_in_channels == INPAINT_UNET_CHANNELS {
                    let masked_image = image.broadcast_mul(&mask.affine(-1., 1.)?)?;
                    let masked_image = self.encode_image(&masked_image)?;
                    let (mask, masked_image) = if use_guidance {
                        (
                            Tensor::cat(&[&latent_mask, &latent_mask], 0)?,
                            Tensor::cat(&[&masked_image, &masked_image], 0)?,
                        )
                    } else {
                        (latent_mask, masked_image)
                    };
                    Inpainting::Channels { mask, masked_image }
                } else {
                    Inpainting::Blend {
                        mask: latent_mask,
                        init_latents: self.encode_image(&image)?,
                        noise,
                    }
                };
                (latents, 0, Some(inpaint))
            }
        };

        for (index, &timestep) in timesteps.iter().enumerate() {
            if index < t_start {
                continue;
            }
            if let Some(Inpainting::Blend {
                mask,
                init_latents,
                noise,
            }) = &inpaint
            {
                let noised = scheduler.add_noise(init_latents, noise.clone(), timestep)?;
                latents = blend(mask, &latents, &noised)?;
            }
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let model_input = match &inpaint {
                Some(Inpainting::Channels { mask, masked_image }) => {
                    Tensor::cat(&[&model_input, mask, masked_image], 1)?
                }
                _ => model_input,
            };

            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((cond - uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), timestep, "denoised");
        }

        if let Some(Inpainting::Blend {
            mask, init_latents, ..
        }) = &inpaint
        {
            latents = blend(mask, &latents, init_latents)?;
        }

        let image = self.decode_latents(&latents)?;
        info!(
            seed = request.seed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generated image"
        );
        Ok(image)
    }
}

pub struct SdLoader;

impl Loader for SdLoader {
    type Model = SdModel;

    async fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
        options: LoadOptions,
    ) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion(SdVariant {
            model_id,
            version,
            mode,
        }) = variant;
        let started = Instant::now();

        // Configure device.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = if options.use_f32 || device.is_cpu() {
            DType::F32
        } else {
            DType::F16
        };
        let fp16 = dtype == DType::F16;
        let config = version.config(options.sliced_attention_size);
        let hub = Hub::new(api, options.offline);
        let repo = model_id.as_str();

        // --- Text encoders ---
        let clip_weights = hub.weights(repo, "text_encoder/model", fp16).await?;
        let clip_tokenizer = hub.get(version.tokenizer_repo(), "tokenizer.json").await?;
        let mut encoders = vec![TextEncoder::new(
            &config.clip,
            &clip_weights,
            &clip_tokenizer,
            &device,
        )?];
        if let Some(clip2) = &config.clip2 {
            let weights = hub.weights(repo, "text_encoder_2/model", fp16).await?;
            let tokenizer = hub.get(CLIP_G_TOKENIZER, "tokenizer.json").await?;
            encoders.push(TextEncoder::new(clip2, &weights, &tokenizer, &device)?);
        }

        // --- Autoencoder ---
        // The SDXL autoencoder overflows in f16, use the patched one.
        let vae_weights = if version.is_xl() && fp16 {
            hub.get(SDXL_FP16_VAE, "diffusion_pytorch_model.safetensors")
                .await?
        } else {
            hub.weights(repo, "vae/diffusion_pytorch_model", fp16).await?
        };
        let vae = config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load autoencoder")?;

        // --- UNet ---
        let unet_weights = hub.weights(repo, "unet/diffusion_pytorch_model", fp16).await?;
        let unet_in_channels = unet_in_channels(&unet_weights)?;
        ensure!(
            unet_in_channels != INPAINT_UNET_CHANNELS || mode == Mode::Inpaint,
            "{repo} is an inpainting model, it cannot run {mode}"
        );
        if mode == Mode::Inpaint && unet_in_channels != INPAINT_UNET_CHANNELS {
            warn!(model = repo, "not an inpainting model, inpainting by latent blending");
        }
        let unet = config
            .build_unet(
                &unet_weights,
                &device,
                unet_in_channels,
                options.use_flash_attn,
                dtype,
            )
            .context("failed to load unet")?;

        info!(
            model = repo,
            %version,
            %mode,
            ?dtype,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );

        Ok(SdModel {
            device,
            dtype,
            version,
            mode,
            unet_in_channels,
            config,
            encoders,
            vae,
            unet,
        })
    }
}
