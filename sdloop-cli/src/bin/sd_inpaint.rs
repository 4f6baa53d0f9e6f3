//! Inpainting: white areas of the mask are repainted, black areas kept.
//!
//! In interactive mode each request is a prompt line, an output line, an initial image line and
//! a mask line.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sdloop_cli::{GenerationArgs, RuntimeArgs};
use sdloop_core::Conditioning;

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive Stable Diffusion inpainting")]
struct Args {
    /// Model repository id or local diffusers directory, must be an inpainting model.
    #[arg(long, default_value = "Lykon/dreamshaper-8-inpainting")]
    model: String,

    /// What the image should not contain.
    #[arg(long)]
    negative_prompt: Option<String>,

    /// Path to the initial image.
    #[arg(long)]
    init_image: PathBuf,

    /// Mask of the region to inpaint on the initial image.
    #[arg(long)]
    mask: PathBuf,

    #[command(flatten)]
    generation: GenerationArgs,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    sdloop_cli::init_tracing();

    let conditioning = Conditioning::Inpaint {
        init_image: args.init_image,
        mask: args.mask,
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
