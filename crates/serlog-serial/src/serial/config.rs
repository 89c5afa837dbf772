//! Session configuration surface.
//!
//! Persistence belongs to the caller; this module only defines the
//! shape, the defaults, loaders for JSON and TOML text, and validation.

use crate::serial::error::{SerialError, SerialResult};
use crate::serial::types::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest accepted interval for repeated sends.
pub const MIN_REPEAT_INTERVAL_MS: u64 = 20;

/// Everything a session needs besides the device itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub connection: ConnectionParams,

    #[serde(default)]
    pub render_mode: RenderMode,

    /// Bytes per hex group.
    #[serde(default = "default_hex_group_width")]
    pub hex_group_width: usize,

    #[serde(default)]
    pub line_ending: LineEnding,

    /// Marker substituted for undecodable input.
    #[serde(default = "default_replacement")]
    pub replacement: String,

    /// Release a pending partial text line when a read times out with
    /// no data. Hex groups always wait until they are full.
    #[serde(default = "default_true")]
    pub idle_flush: bool,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Per-consumer queue bound of the output hub.
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,

    /// Size of a single transport read.
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_hex_group_width() -> usize {
    16
}
fn default_replacement() -> String {
    char::REPLACEMENT_CHARACTER.to_string()
}
fn default_true() -> bool {
    true
}
fn default_history_capacity() -> usize {
    50
}
fn default_hub_capacity() -> usize {
    1024
}
fn default_read_chunk() -> usize {
    128
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionParams::default(),
            render_mode: RenderMode::default(),
            hex_group_width: default_hex_group_width(),
            line_ending: LineEnding::default(),
            replacement: default_replacement(),
            idle_flush: true,
            history_capacity: default_history_capacity(),
            hub_capacity: default_hub_capacity(),
            read_chunk: default_read_chunk(),
            log: LogConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Default configuration for the given port.
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            connection: ConnectionParams::new(port_name),
            ..Default::default()
        }
    }

    pub fn from_json(content: &str) -> SerialResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| SerialError::invalid_config(format!("invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> SerialResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SerialError::invalid_config(format!("invalid TOML config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` or `.toml` file, chosen by extension.
    pub fn from_file(path: &Path) -> SerialResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SerialError::invalid_config(format!("cannot read {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    pub fn to_json(&self) -> SerialResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SerialError::invalid_config(e.to_string()))
    }

    pub fn validate(&self) -> SerialResult<()> {
        validate_params(&self.connection)?;
        if self.hex_group_width == 0 {
            return Err(SerialError::invalid_config("hex group width must be positive"));
        }
        if self.history_capacity == 0 {
            return Err(SerialError::invalid_config("history capacity must be positive"));
        }
        if self.hub_capacity == 0 {
            return Err(SerialError::invalid_config("hub capacity must be positive"));
        }
        if self.read_chunk == 0 {
            return Err(SerialError::invalid_config("read chunk must be positive"));
        }
        if let TimestampFormat::Custom(ref pattern) = self.log.timestamp {
            crate::serial::logging::check_timestamp_pattern(pattern)?;
        }
        Ok(())
    }
}

/// Checks that hold for every transport.
pub fn validate_params(params: &ConnectionParams) -> SerialResult<()> {
    if params.port_name.trim().is_empty() {
        return Err(SerialError::invalid_config("port name is empty"));
    }
    if params.baud_rate == 0 {
        return Err(SerialError::invalid_config("baud rate must be positive")
            .with_port(&params.port_name));
    }
    if params.read_timeout_ms == 0 {
        return Err(SerialError::invalid_config("read timeout must be positive")
            .with_port(&params.port_name));
    }
    if params.text_encoding().is_none() {
        return Err(SerialError::invalid_config(format!(
            "unknown text encoding '{}'",
            params.encoding
        ))
        .with_port(&params.port_name));
    }
    Ok(())
}
