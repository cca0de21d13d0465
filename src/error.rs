//! Caller-facing errors for story operations.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("invalid input: {0}")]
    Invalid(&'static str),
    #[error("media upload failed: {0:#}")]
    Upload(#[source] anyhow::Error),
    #[error("store unavailable: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error("no conversation with the author yet; establish contact first")]
    ContactRequired,
}

impl StoryError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoryError::Upload(_) | StoryError::Store(_))
    }
}

impl From<anyhow::Error> for StoryError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StoryError>() {
            Ok(story) => story,
            Err(other) => StoryError::Store(other),
        }
    }
}
