// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Center configuration.

use kmservice::ResendPolicy;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Center configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CenterConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 8888)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum number of connected services
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Interval between IS_ACTIVE pings, also the liveness window (seconds)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Time allowed for the ConnApply frame (seconds)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Frame bound for the ConnApply frame (bytes)
    #[serde(default = "default_handshake_frame_size")]
    pub handshake_frame_size: usize,

    /// Frame bound once connected (bytes)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_resend_after")]
    pub resend_after_secs: u64,

    #[serde(default = "default_max_resends")]
    pub max_resends: u32,

    /// Outbound frame queue depth per connection
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Request tags remembered per connection for duplicate detection
    #[serde(default = "default_recent_tags")]
    pub recent_tags: usize,

    /// Directory seed (services, subscriptions, initial data) in JSON
    #[serde(default)]
    pub directory_path: Option<PathBuf>,

    /// SQLite archive of sent envelopes (in-memory archive when unset)
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8888
}

fn default_max_pool_size() -> usize {
    1000
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
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

fn default_outbound_capacity() -> usize {
    256
}

fn default_recent_tags() -> usize {
    1024
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_pool_size: default_max_pool_size(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            handshake_frame_size: default_handshake_frame_size(),
            max_frame_size: default_max_frame_size(),
            sweep_interval_secs: default_sweep_interval(),
            resend_after_secs: default_resend_after(),
            max_resends: default_max_resends(),
            outbound_capacity: default_outbound_capacity(),
            recent_tags: default_recent_tags(),
            directory_path: None,
            archive_path: None,
        }
    }
}

impl CenterConfig {
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

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            resend_after: Duration::from_secs(self.resend_after_secs),
            max_resends: self.max_resends,
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::InvalidValue("max_pool_size cannot be 0".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_secs cannot be 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_secs cannot be 0".into(),
            ));
        }
        if self.handshake_frame_size == 0 || self.handshake_frame_size > self.max_frame_size {
            return Err(ConfigError::InvalidValue(
                "handshake_frame_size must be in 1..=max_frame_size".into(),
            ));
        }
        if self.outbound_capacity == 0 || self.recent_tags == 0 {
            return Err(ConfigError::InvalidValue(
                "outbound_capacity and recent_tags cannot be 0".into(),
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
