#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
pub mod loader;
mod loader_factory;
pub mod mask;
pub mod request;
pub mod session;
mod util;

mod stable_diffusion;

pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use request::*;
pub use session::{run_session, SessionError, SessionState, SessionSummary, GENERATION_DONE};
pub use stable_diffusion::{SdLoader, SdModel, SdVersion, SdVariant};
pub use util::{save_image, select_best_device};

/// A loaded generation capability: maps one request to one image.
pub trait ModelLike {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage>;
}

impl<M: ModelLike + ?Sized> ModelLike for Box<M> {
    fn run(&self, request: GenerationRequest) -> anyhow::Result<DynamicImage> {
        (**self).run(request)
    }
}
