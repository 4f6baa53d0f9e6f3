use std::path::{Path, PathBuf};

use sdloop_core::Mode;
use serde::{Deserialize, Serialize};

use crate::AdapterError;

/// How to start the pipeline of one mode. The generation flags are appended to `args`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PipelineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Model identifier passed to each mode's pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPreset {
    pub text_to_image: String,
    pub image_to_image: String,
    pub inpaint: String,
}

impl ModelPreset {
    /// DreamShaper 8, a Stable Diffusion 1.5 fine-tune with a dedicated inpainting model.
    pub fn sd15() -> Self {
        Self {
            text_to_image: "Lykon/dreamshaper-8".to_string(),
            image_to_image: "Lykon/dreamshaper-8".to_string(),
            inpaint: "Lykon/dreamshaper-8-inpainting".to_string(),
        }
    }

    pub fn sdxl() -> Self {
        let model = "stabilityai/stable-diffusion-xl-base-1.0".to_string();
        Self {
            text_to_image: model.clone(),
            image_to_image: model.clone(),
            inpaint: model,
        }
    }

    pub fn model(&self, mode: Mode) -> &str {
        match mode {
            Mode::TextToImage => &self.text_to_image,
            Mode::ImageToImage => &self.image_to_image,
            Mode::Inpaint => &self.inpaint,
        }
    }
}

impl Default for ModelPreset {
    fn default() -> Self {
        Self::sd15()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub text_to_image: PipelineCommand,
    pub image_to_image: PipelineCommand,
    pub inpaint: PipelineCommand,
    #[serde(default)]
    pub models: ModelPreset,
    /// Exported as `HF_HOME` to the pipelines.
    #[serde(default)]
    pub hf_home: Option<PathBuf>,
    /// Keep one interactive pipeline alive between calls instead of starting one per call.
    #[serde(default)]
    pub keep_pipeline_running: bool,
    /// Appended to every launch, e.g. `["--offline"]`.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl AdapterConfig {
    /// Uses the `sd`, `sd-img2img` and `sd-inpaint` binaries found in `bin_dir`.
    pub fn from_bin_dir(
        bin_dir: impl AsRef<Path>,
        models: ModelPreset,
        keep_pipeline_running: bool,
    ) -> Self {
        let bin = |name: &str| {
            PipelineCommand::new(
                bin_dir
                    .as_ref()
                    .join(format!("{name}{}", std::env::consts::EXE_SUFFIX)),
            )
        };
        Self {
            text_to_image: bin("sd"),
            image_to_image: bin("sd-img2img"),
            inpaint: bin("sd-inpaint"),
            models,
            hf_home: None,
            keep_pipeline_running,
            extra_args: Vec::new(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn command(&self, mode: Mode) -> &PipelineCommand {
        match mode {
            Mode::TextToImage => &self.text_to_image,
            Mode::ImageToImage => &self.image_to_image,
            Mode::Inpaint => &self.inpaint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_dir_layout() {
        let config = AdapterConfig::from_bin_dir("/opt/sdloop/bin", ModelPreset::sdxl(), true);
        let suffix = std::env::consts::EXE_SUFFIX;
        assert_eq!(
            config.command(Mode::ImageToImage).program,
            PathBuf::from(format!("/opt/sdloop/bin/sd-img2img{suffix}"))
        );
        assert_eq!(
            config.models.model(Mode::Inpaint),
            "stabilityai/stable-diffusion-xl-base-1.0"
        );
    }

    #[test]
    fn json_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.json");
        std::fs::write(
            &path,
            r#"{
                "text_to_image": { "program": "/usr/local/bin/sd" },
                "image_to_image": { "program": "/usr/local/bin/sd-img2img" },
                "inpaint": { "program": "/usr/local/bin/sd-inpaint", "args": ["--cpu"] },
                "keep_pipeline_running": true
            }"#,
        )
        .unwrap();

        let config = AdapterConfig::from_json_file(&path).unwrap();
        assert!(config.keep_pipeline_running);
        assert_eq!(config.models, ModelPreset::sd15());
        assert_eq!(config.inpaint.args, ["--cpu"]);
        assert_eq!(config.hf_home, None);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            AdapterConfig::from_json_file(&path),
            Err(AdapterError::Config(_))
        ));
    }
}
