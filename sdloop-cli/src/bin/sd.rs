//! Text-to-image.
//!
//! ```bash
//! sd --prompt "a lighthouse at dawn" --output lighthouse.jpg
//! sd --interactive --seed 42     # then one prompt line and one output line per request
//! ```

use anyhow::Result;
use clap::Parser;
use sdloop_cli::{GenerationArgs, RuntimeArgs};
use sdloop_core::Conditioning;

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive Stable Diffusion text-to-image")]
struct Args {
    /// Model repository id or local diffusers directory.
    #[arg(long, default_value = "stabilityai/stable-diffusion-xl-base-1.0")]
    model: String,

    /// What the image should not contain.
    #[arg(
        long,
        default_value = "disfigured hands, ugly, deformed, signature, watermark, stamp"
    )]
    negative_prompt: String,

    #[command(flatten)]
    generation: GenerationArgs,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    sdloop_cli::init_tracing();

    sdloop_cli::run(
        &args.model,
        Some(args.negative_prompt),
        args.generation,
        args.runtime,
        Conditioning::TextToImage,
    )
    .await
}
