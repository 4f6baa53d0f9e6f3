//! Image-to-image: the initial image is partially noised and denoised towards the prompt.
//!
//! In interactive mode each request is a prompt line, an output line and an initial image line.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sdloop_cli::{parse_strength, GenerationArgs, RuntimeArgs};
use sdloop_core::Conditioning;

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive Stable Diffusion image-to-image")]
struct Args {
    /// Model repository id or local diffusers directory.
    #[arg(long, default_value = "Lykon/dreamshaper-8")]
    model: String,

    /// What the image should not contain.
    #[arg(long)]
    negative_prompt: Option<String>,

    /// Path to the initial image.
    #[arg(long)]
    init_image: PathBuf,

    /// How much the initial image is transformed, 0 keeps it and 1 ignores it.
    #[arg(long, alias = "strengthe", default_value_t = 0.3, value_parser = parse_strength)]
    strength: f64,

    #[command(flatten)]
    generation: GenerationArgs,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    sdloop_cli::init_tracing();

    let conditioning = Conditioning::ImageToImage {
        init_image: args.init_image,
        strength: args.strength,
    };
    sdloop_cli::run(
        &args.model,
        args.negative_prompt,
        args.generation,
        args.runtime,
        conditioning,
    )
    .await
}
