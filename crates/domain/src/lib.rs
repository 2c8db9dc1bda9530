//! Shared types for the ChatBridge workspace: the error taxonomy and the
//! bridge configuration.

pub mod config;
pub mod error;

pub use config::{BridgeConfig, ReconnectConfig, SessionsConfig};
pub use error::{Error, Result};
