use std::time::Duration;

use thiserror::Error;

/// Why a single enrichment attempt failed.
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid input: {0}")]
    Input(String),
}

impl EnrichError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichError::Input(_) => false,
            EnrichError::Status { status, .. } => {
                matches!(*status, 408 | 429) || *status >= 500
            }
            _ => true,
        }
    }
}

impl From<serde_json::Error> for EnrichError {
    fn from(e: serde_json::Error) -> Self {
        EnrichError::Malformed(e.to_string())
    }
}
