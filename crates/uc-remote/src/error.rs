//! Device client errors

use thiserror::Error;

/// Errors raised while talking to the remote
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote rejected the API key or PIN
    #[error("authentication rejected by the remote")]
    Authentication,

    #[error("remote answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("integration not found for driver {0}")]
    IntegrationNotFound(String),

    #[error("invalid remote address: {0}")]
    InvalidUrl(String),

    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid header value: {0}")]
    Header(String),
}

impl RemoteError {
    /// Short error key shown to the user in the selection form
    pub fn form_key(&self) -> &'static str {
        match self {
            RemoteError::Authentication => "invalid_auth",
            RemoteError::Http(_) | RemoteError::InvalidUrl(_) | RemoteError::Socket(_) => {
                "cannot_connect"
            }
            _ => "ha_driver_failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
