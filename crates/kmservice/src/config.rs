// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer configuration.

use crate::pending::ResendPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration for a peer session.
///
/// Field names also accept the historical capitalized spelling
/// (`CenterIP`, `CenterPort`, `Token`, `ServiceId`, `ServiceName`, `FilePath`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Center host name or address
    #[serde(default = "default_center_ip", alias = "CenterIP")]
    pub center_ip: String,

    /// Center TCP port
    #[serde(default = "default_center_port", alias = "CenterPort")]
    pub center_port: u16,

    /// Shared token presented at connect
    #[serde(default, alias = "Token")]
    pub token: String,

    /// This service's id
    #[serde(default, alias = "ServiceId")]
    pub service_id: i64,

    #[serde(default, alias = "ServiceName")]
    pub service_name: String,

    /// SQLite archive of sent envelopes (in-memory archive when unset)
    #[serde(default, alias = "FilePath")]
    pub file_path: Option<PathBuf>,

    /// Consecutive read/decode failures tolerated before the session ends
    #[serde(default = "default_max_error_times")]
    pub max_error_times: u32,

    /// Frame bound while handshaking (bytes)
    #[serde(default = "default_handshake_frame_size")]
    pub handshake_frame_size: usize,

    /// Frame bound once connected (bytes)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Age after which an unconfirmed request is resent
    #[serde(default = "default_resend_after")]
    pub resend_after_secs: u64,

    #[serde(default = "default_max_resends")]
    pub max_resends: u32,

    /// Delay before re-issuing a GET refused with DATA_LOCKED
    #[serde(default = "default_locked_retry")]
    pub locked_retry_ms: u64,

    /// Inbound UPDATE queue depth
    #[serde(default = "default_queue_capacity")]
    pub update_queue_capacity: usize,

    /// Outbound frame queue depth
    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_center_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_center_port() -> u16 {
    8888
}

fn default_max_error_times() -> u32 {
    10
}

fn default_handshake_frame_size() -> usize {
    20 * 1024
}

fn default_max_frame_size() -> usize {
    400 * 1024
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_resend_after() -> u64 {
    300
}

fn default_max_resends() -> u32 {
    10
}

fn default_locked_retry() -> u64 {
    5000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            center_ip: default_center_ip(),
            center_port: default_center_port(),
            token: String::new(),
            service_id: 0,
            service_name: String::new(),
            file_path: None,
            max_error_times: default_max_error_times(),
            handshake_frame_size: default_handshake_frame_size(),
            max_frame_size: default_max_frame_size(),
            sweep_interval_secs: default_sweep_interval(),
            resend_after_secs: default_resend_after(),
            max_resends: default_max_resends(),
            locked_retry_ms: default_locked_retry(),
            update_queue_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl PeerConfig {
    /// Minimal configuration for reaching a center.
    pub fn new(center_ip: impl Into<String>, center_port: u16, service_id: i64, token: impl Into<String>) -> Self {
        Self {
            center_ip: center_ip.into(),
            center_port,
            service_id,
            token: token.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `host:port` of the center.
    pub fn center_addr(&self) -> String {
        format!("{}:{}", self.center_ip, self.center_port)
    }

    pub fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            resend_after: Duration::from_secs(self.resend_after_secs),
            max_resends: self.max_resends,
        }
    }

    pub fn locked_retry(&self) -> Duration {
        Duration::from_millis(self.locked_retry_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.center_ip.is_empty() {
            return Err(ConfigError::InvalidValue("center_ip cannot be empty".into()));
        }
        if self.center_port == 0 {
            return Err(ConfigError::InvalidValue("center_port cannot be 0".into()));
        }
        if self.max_error_times == 0 {
            return Err(ConfigError::InvalidValue(
                "max_error_times cannot be 0".into(),
            ));
        }
        if self.handshake_frame_size == 0 || self.max_frame_size == 0 {
            return Err(ConfigError::InvalidValue(
                "frame sizes cannot be 0".into(),
            ));
        }
        if self.handshake_frame_size > self.max_frame_size {
            return Err(ConfigError::InvalidValue(
                "handshake_frame_size cannot exceed max_frame_size".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_secs cannot be 0".into(),
            ));
        }
        if self.update_queue_capacity == 0 || self.outbound_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue capacities cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
