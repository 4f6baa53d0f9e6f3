use anyhow::Result;
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, LoadOptions, Loader, Mode, ModelLike, SdLoader, SdVariant, SdVersion};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelVariant {
    StableDiffusion(SdVariant),
}

impl ModelVariant {
    /// Detect the model family from its name. `version` overrides the detection.
    pub fn from_name(model_name: &str, mode: Mode, version: Option<SdVersion>) -> Self {
        let version = version.unwrap_or_else(|| SdVersion::from_name(model_name));
        ModelVariant::StableDiffusion(SdVariant {
            model_id: model_name.to_string(),
            version,
            mode,
        })
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    mode: Mode,
    version: Option<SdVersion>,
    api: Api,
    device_map: DeviceMap,
    options: LoadOptions,
) -> Result<Box<dyn ModelLike>> {
    let variant = ModelVariant::from_name(model_name, mode, version);
    info!(model = model_name, ?variant, %device_map, "loading model");

    match variant {
        ModelVariant::StableDiffusion(_) => {
            let model = SdLoader::load(variant, api, device_map, options).await?;
            Ok(Box::new(model))
        }
    }
}
