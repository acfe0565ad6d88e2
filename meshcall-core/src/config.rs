//! Service configuration

use crate::types::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// STUN/TURN server handed to peer transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    /// Server URLs (`stun:` / `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Mesh call service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshCallConfig {
    /// ICE servers for every peer transport
    pub ice_servers: Vec<IceServerConfig>,
    /// Capture request for calls (narrowed to audio for audio calls)
    pub media: MediaConstraints,
    /// How long `start_call` waits for the authority's `call-started`
    pub call_started_timeout_ms: u64,
    /// Buffer of the call event broadcast channel
    pub event_capacity: usize,
    /// Buffer of the service command queue
    pub command_capacity: usize,
}

impl Default for MeshCallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            media: MediaConstraints::default(),
            call_started_timeout_ms: 10_000,
            event_capacity: 256,
            command_capacity: 64,
        }
    }
}

impl MeshCallConfig {
    /// Parse from JSON; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// `call_started_timeout_ms` as a duration
    pub fn call_started_timeout(&self) -> Duration {
        Duration::from_millis(self.call_started_timeout_ms)
    }
}
