//! Error types for minerpool-provider

use thiserror::Error;

/// Errors that can occur talking to the VM provider or to a VM
#[derive(Error, Debug)]
pub enum ProviderError {
    /// No API key configured for the provider
    #[error("provider API key is not configured")]
    MissingApiKey,

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Provider answered with a non-2xx status
    #[error("provider API returned {status}: {body}")]
    Api { status: u16, body: String },

    /// Provider response could not be interpreted
    #[error("unexpected provider response: {0}")]
    Decode(String),

    /// VM is unknown to the provider
    #[error("vm not found at provider: {0}")]
    VmNotFound(String),

    /// VM exists but has no public address yet
    #[error("vm {0} has no public address yet")]
    NoAddress(String),

    /// Remote shell could not reach the VM
    #[error("remote shell to {host} failed: {reason}")]
    Transport { host: String, reason: String },

    /// Remote command exceeded its time limit
    #[error("remote command on {host} timed out after {limit_secs}s")]
    Timeout { host: String, limit_secs: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// Whether the failure means "could not reach the machine", as opposed
    /// to the machine answering with an error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProviderError::Http(_)
                | ProviderError::Transport { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::NoAddress(_)
                | ProviderError::VmNotFound(_)
                | ProviderError::Io(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Http(err.to_string())
    }
}
