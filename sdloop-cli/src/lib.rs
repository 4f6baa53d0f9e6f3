//! Shared plumbing of the `sd`, `sd-img2img` and `sd-inpaint` binaries.

use anyhow::Result;
use clap::Args;
use hf_hub::api::tokio::Api;
use sdloop_core::{
    load_model, run_session, Conditioning, DeviceMap, LoadOptions, RequestRecord, SdVersion,
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_PROMPT: &str = "a painting of a beautiful graceful woman with long hair";

/// Request fields shared by every mode.
#[derive(Args, Debug, Clone)]
pub struct GenerationArgs {
    /// Random seed for generating consistent images per prompt, drawn at random when omitted.
    /// Incremented by one after every interactive generation.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 20)]
    pub num_inference_steps: usize,

    /// Classifier-free guidance scale, guidance is disabled at 1.0 or below.
    #[arg(long, default_value_t = 7.5)]
    pub guidance_scale: f64,

    /// The prompt of the first generation.
    #[arg(long, default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Output image path, always written as JPEG.
    #[arg(long, default_value = "output.jpg")]
    pub output: String,

    /// Keep the pipeline loaded and read further requests from stdin after each generation.
    #[arg(long)]
    pub interactive: bool,

    /// Width of the generated image, defaults to the model's native size (or the initial
    /// image's).
    #[arg(long)]
    pub width: Option<usize>,

    /// Height of the generated image.
    #[arg(long)]
    pub height: Option<usize>,
}

/// Where and how the pipeline runs.
#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    pub cpu: bool,

    /// Accelerator ordinal.
    #[arg(long, default_value_t = 0)]
    pub device: usize,

    /// Keep f32 weights on the accelerator instead of f16.
    #[arg(long)]
    pub use_f32: bool,

    /// Only use files already in the Hugging Face cache.
    #[arg(long)]
    pub offline: bool,

    /// Model family (v1-5, v2-1, xl, turbo), detected from the model name when omitted.
    #[arg(long)]
    pub sd_version: Option<SdVersion>,

    /// The size of the sliced attention or 0 for automatic slicing (disabled by default).
    #[arg(long)]
    pub sliced_attention_size: Option<usize>,

    /// Use flash attention in the UNet, needs the `flash-attn` feature.
    #[arg(long)]
    pub use_flash_attn: bool,
}

impl RuntimeArgs {
    fn load_options(&self) -> LoadOptions {
        if self.use_flash_attn && !cfg!(feature = "flash-attn") {
            warn!("--use-flash-attn ignored, build with `--features flash-attn`");
        }
        LoadOptions {
            use_f32: self.use_f32,
            offline: self.offline,
            sliced_attention_size: self.sliced_attention_size,
            use_flash_attn: self.use_flash_attn && cfg!(feature = "flash-attn"),
        }
    }
}

/// Parses an img2img strength, which must lie in `[0, 1]`.
pub fn parse_strength(value: &str) -> Result<f64, String> {
    let strength: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&strength) {
        Ok(strength)
    } else {
        Err(format!("strength must be between 0 and 1, got {strength}"))
    }
}

/// Logs go to stderr, stdout carries the interactive protocol.
pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Builds the request record from the flags, loads the model and runs the session on
/// stdin/stdout.
pub async fn run(
    model: &str,
    negative_prompt: Option<String>,
    generation: GenerationArgs,
    runtime: RuntimeArgs,
    conditioning: Conditioning,
) -> Result<()> {
    let mode = conditioning.mode();
    let mut record = RequestRecord::new(
        generation.prompt,
        generation.output,
        generation.seed,
        conditioning,
    );
    record.negative_prompt = negative_prompt;
    record.steps = generation.num_inference_steps;
    record.guidance_scale = generation.guidance_scale;
    record.width = generation.width;
    record.height = generation.height;
    info!(%mode, seed = record.seed, interactive = generation.interactive, "starting session");

    let model = load_model(
        model,
        mode,
        runtime.sd_version,
        Api::new()?,
        DeviceMap::from_flags(runtime.cpu, runtime.device),
        runtime.load_options(),
    )
    .await?;

    let summary = run_session(
        &model,
        &mut record,
        generation.interactive,
        std::io::stdin().lock(),
        std::io::stdout().lock(),
    )?;
    info!(
        iterations = summary.iterations,
        last_seed = summary.last_seed,
        "session finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strength_must_be_a_fraction() {
        assert_eq!(parse_strength("0.3"), Ok(0.3));
        assert_eq!(parse_strength("1"), Ok(1.0));
        assert!(parse_strength("1.5").is_err());
        assert!(parse_strength("strong").is_err());
    }
}
