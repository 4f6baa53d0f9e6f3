//! Drives the `sd`, `sd-img2img` and `sd-inpaint` pipelines from another process.
//!
//! In stateless mode every call starts a pipeline, lets it generate one image and waits for it
//! to exit. With [`AdapterConfig::keep_pipeline_running`] the first call starts an interactive
//! pipeline and later calls of the same kind are sent over its stdin, skipping the model load.
//! A call of another kind stops the running pipeline and starts the right one.
//!
//! ```no_run
//! # async fn demo() -> Result<(), sdloop_adapter::AdapterError> {
//! use sdloop_adapter::{Adapter, AdapterConfig, ModelPreset};
//!
//! let config = AdapterConfig::from_bin_dir("target/release", ModelPreset::sd15(), true);
//! let mut adapter = Adapter::new(config);
//! adapter.text_to_image("a lighthouse at dawn", "/tmp/1.jpg".as_ref(), 7).await?;
//! adapter.text_to_image("a lighthouse at dusk", "/tmp/2.jpg".as_ref(), 8).await?;
//! adapter.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use sdloop_core::Mode;
use thiserror::Error;

mod config;
mod process;

pub use config::{AdapterConfig, ModelPreset, PipelineCommand};
use process::{LaunchKey, RunningPipeline};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{} does not exist", .0.display())]
    MissingInput(PathBuf),
    #[error("failed to launch {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{} contains a line break, it cannot be sent to a running pipeline", .0.display())]
    MultiLinePath(PathBuf),
    #[error("{mode} pipeline exited before finishing the generation ({status})")]
    PipelineExited { mode: Mode, status: String },
    #[error("{mode} pipeline failed ({status})")]
    PipelineFailed { mode: Mode, status: String },
    #[error("invalid adapter configuration")]
    Config(#[from] serde_json::Error),
    #[error("failed to convert mask")]
    Mask(#[source] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One generation as the pipelines receive it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Request {
    pub(crate) mode: Mode,
    pub(crate) prompt: String,
    pub(crate) output: PathBuf,
    pub(crate) seed: u64,
    pub(crate) init_image: Option<PathBuf>,
    pub(crate) mask: Option<PathBuf>,
    pub(crate) strength: Option<f64>,
}

/// Newlines cannot cross the line protocol, they become spaces.
fn single_line(prompt: &str) -> String {
    prompt.replace(['\r', '\n'], " ")
}

/// Paths are sent one per line to a running pipeline.
fn ensure_single_line(path: &Path) -> Result<(), AdapterError> {
    if path.as_os_str().as_encoded_bytes().contains(&b'\n') {
        Err(AdapterError::MultiLinePath(path.to_path_buf()))
    } else {
        Ok(())
    }
}

fn ensure_exists(path: &Path) -> Result<(), AdapterError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(AdapterError::MissingInput(path.to_path_buf()))
    }
}

pub struct Adapter {
    config: AdapterConfig,
    running: Option<RunningPipeline>,
}

impl Adapter {
    /// No process is started until the first call.
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Mode of the interactive pipeline currently kept alive, if any.
    pub fn current_pipeline(&self) -> Option<Mode> {
        self.running.as_ref().map(|running| running.key.mode)
    }

    pub async fn text_to_image(
        &mut self,
        prompt: &str,
        output: &Path,
        seed: u64,
    ) -> Result<(), AdapterError> {
        self.generate(Request {
            mode: Mode::TextToImage,
            prompt: single_line(prompt),
            output: output.to_path_buf(),
            seed,
            init_image: None,
            mask: None,
            strength: None,
        })
        .await
    }

    pub async fn image_to_image(
        &mut self,
        prompt: &str,
        init_image: &Path,
        output: &Path,
        seed: u64,
        strength: f64,
    ) -> Result<(), AdapterError> {
        ensure_exists(init_image)?;
        self.generate(Request {
            mode: Mode::ImageToImage,
            prompt: single_line(prompt),
            output: output.to_path_buf(),
            seed,
            init_image: Some(init_image.to_path_buf()),
            mask: None,
            strength: Some(strength),
        })
        .await
    }

    pub async fn inpaint(
        &mut self,
        prompt: &str,
        init_image: &Path,
        mask: &Path,
        output: &Path,
        seed: u64,
    ) -> Result<(), AdapterError> {
        ensure_exists(init_image)?;
        ensure_exists(mask)?;
        self.generate(Request {
            mode: Mode::Inpaint,
            prompt: single_line(prompt),
            output: output.to_path_buf(),
            seed,
            init_image: Some(init_image.to_path_buf()),
            mask: Some(mask.to_path_buf()),
            strength: None,
        })
        .await
    }

    /// Converts an alpha-channel (OpenAI style) mask into an inpainting mask written next to it
    /// and returns its path.
    pub fn convert_openai_mask(&self, mask: &Path) -> Result<PathBuf, AdapterError> {
        ensure_exists(mask)?;
        sdloop_core::mask::convert_openai_mask(mask).map_err(AdapterError::Mask)
    }

    /// Ends the running pipeline, if any, by closing its input.
    pub async fn shutdown(&mut self) -> Result<(), AdapterError> {
        match self.running.take() {
            Some(running) => running.close().await,
            None => Ok(()),
        }
    }

    async fn generate(&mut self, request: Request) -> Result<(), AdapterError> {
        if !self.config.keep_pipeline_running {
            return process::run_once(&self.config, &request).await;
        }
        for path in [Some(&request.output), request.init_image.as_ref(), request.mask.as_ref()]
            .into_iter()
            .flatten()
        {
            ensure_single_line(path)?;
        }

        if let Some(running) = self.running.as_mut() {
            if running.key == LaunchKey::of(&request) {
                let result = running.submit(&request).await;
                if result.is_err() {
                    // A pipeline that failed once is not reused.
                    if let Some(running) = self.running.take() {
                        running.kill().await;
                    }
                }
                return result;
            }
        }

        if let Some(running) = self.running.take() {
            running.kill().await;
        }
        self.running = Some(RunningPipeline::launch(&self.config, &request).await?);
        Ok(())
    }
}
