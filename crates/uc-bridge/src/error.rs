//! Bridge errors

use thiserror::Error;
use uc_hass::ListenerError;
use uc_remote::RemoteError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("client connection closed")]
    ConnectionClosed,

    #[error("client connection is not keeping up")]
    ConnectionBusy,

    #[error("failed to notify client: {0}")]
    Notify(String),

    #[error("integration is not set up")]
    NotSetUp,

    #[error("no remote configured as {0}")]
    UnknownRemote(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}
