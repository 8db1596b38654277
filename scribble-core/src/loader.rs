use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hf_hub::api::tokio::Api;

use crate::ComputeTarget;

/// Builds one model for a resolved compute target.
///
/// Implementations do all network and disk work; callers only see the
/// finished handle or the error that stopped construction.
#[async_trait]
pub trait Loader<M: ?Sized + 'static>: Send + Sync {
    async fn load(&self, target: &ComputeTarget) -> Result<Arc<M>>;
}

/// Hub repositories the default loaders pull weights from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRepos {
    pub base: String,
    pub controlnet: String,
    pub annotator: String,
    pub tokenizer: String,
}

impl Default for ModelRepos {
    fn default() -> Self {
        Self {
            base: "stable-diffusion-v1-5/stable-diffusion-v1-5".to_string(),
            controlnet: "lllyasviel/control_v11p_sd15_scribble".to_string(),
            annotator: "lllyasviel/Annotators".to_string(),
            tokenizer: "openai/clip-vit-base-patch32".to_string(),
        }
    }
}

/// Resolves `filename` from `repo`, downloading it into the local hub cache on first use.
pub(crate) async fn fetch(api: &Api, repo: &str, filename: &str) -> Result<PathBuf> {
    tracing::debug!(repo, filename, "resolving model file");
    api.repo(hf_hub::Repo::model(repo.to_string()))
        .get(filename)
        .await
        .with_context(|| format!("failed to get {filename} from {repo}"))
}
