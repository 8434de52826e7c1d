//! Leaf error type for the upstream provider client.

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("model not loaded / endpoint unavailable")]
    ModelNotLoaded,

    #[error("response stream ended unexpectedly: {0}")]
    Stream(String),

    #[error("failed to decode upstream response: {0}")]
    Decode(#[from] serde_json::Error),
}
