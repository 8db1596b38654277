use thiserror::Error;

/// Failures of a sketch-to-image request, tagged by the stage that produced them.
#[derive(Debug, Error)]
pub enum SketchError {
    /// The caller sent something we refuse to run models on.
    #[error("{0}")]
    Validation(String),
    #[error("failed to load {model}: {message}")]
    Load { model: &'static str, message: String },
    #[error("{0}")]
    Preprocess(String),
    #[error("{0}")]
    Generation(String),
}

impl SketchError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn load(model: &'static str, err: &anyhow::Error) -> Self {
        Self::Load {
            model,
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn preprocess(err: impl std::fmt::Display) -> Self {
        Self::Preprocess(err.to_string())
    }

    pub(crate) fn generation(err: &anyhow::Error) -> Self {
        Self::Generation(format!("{err:#}"))
    }
}
