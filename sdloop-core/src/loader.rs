use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, ModelLike, ModelVariant};

/// Runtime knobs that do not change which weights are loaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Keep f32 even on accelerators.
    pub use_f32: bool,
    /// Resolve every file from the local Hugging Face cache, never from the network.
    pub offline: bool,
    pub sliced_attention_size: Option<usize>,
    pub use_flash_attn: bool,
}

pub trait Loader {
    type Model: ModelLike;

    fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
