//! Unfolded Circle remote device access
//!
//! [`RemoteClient`] is the small surface the bridge needs from a remote:
//! list integrations, read and configure integration entities, and learn the
//! remote's network address. [`HttpRemote`] implements it over the remote's
//! REST API. [`RemoteEventSocket`] keeps the push socket open and maintains
//! a cache of device attributes.

pub mod client;
mod error;
pub mod http;
pub mod socket;
pub mod update;

pub use client::{
    is_hass_driver, IntegrationEntity, IntegrationInstance, RemoteClient, WifiInfo,
    HASS_DRIVER_PREFIX,
};
pub use error::{RemoteError, Result};
pub use http::{HttpRemote, RemoteConfig, SystemInfo, VersionInfo};
pub use socket::{RemoteEventSocket, ResumeCallback, SocketConfig};
pub use update::{RemoteState, RemoteUpdate, RemoteUpdateType};
