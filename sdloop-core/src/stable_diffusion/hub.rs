use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hf_hub::{api::tokio::Api, Cache};
use tracing::debug;

/// Resolves repository files from a local diffusers directory, the Hugging Face cache (offline),
/// or the hub.
pub(crate) struct Hub {
    api: Api,
    cache: Cache,
    offline: bool,
}

impl Hub {
    pub(crate) fn new(api: Api, offline: bool) -> Self {
        Self {
            api,
            cache: Cache::from_env(),
            offline,
        }
    }

    pub(crate) async fn get(&self, repo: &str, file: &str) -> Result<PathBuf> {
        let local = Path::new(repo);
        if local.is_dir() {
            let path = local.join(file);
            return if path.is_file() {
                Ok(path)
            } else {
                Err(anyhow!("{} does not exist", path.display()))
            };
        }

        if self.offline {
            return self
                .cache
                .model(repo.to_string())
                .get(file)
                .ok_or_else(|| anyhow!("{file} from {repo} is not in the local cache"));
        }

        self.api
            .model(repo.to_string())
            .get(file)
            .await
            .with_context(|| format!("failed to get {file} from {repo}"))
    }

    /// `{stem}.fp16.safetensors` when `prefer_fp16` and available, `{stem}.safetensors` otherwise.
    pub(crate) async fn weights(&self, repo: &str, stem: &str, prefer_fp16: bool) -> Result<PathBuf> {
        if prefer_fp16 {
            match self.get(repo, &format!("{stem}.fp16.safetensors")).await {
                Ok(path) => return Ok(path),
                Err(err) => debug!(repo, stem, "no fp16 weights, falling back: {err:#}"),
            }
        }
        self.get(repo, &format!("{stem}.safetensors")).await
    }
}
