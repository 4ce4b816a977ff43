//! # Harness Configuration
//!
//! One TOML file covers the scheduler, both transports and the sketch the
//! `hostmock` binary runs. Every field has a default, so an empty file (or
//! no file at all) is a valid configuration.
//!
//! ```toml
//! [scheduler]
//! tick_interval_ms = 1
//! run_once = false
//!
//! [stream]
//! buffer_capacity = 65536
//! connect_timeout_ms = 5000
//! nodelay = true
//!
//! [datagram]
//! buffer_capacity = 2048
//! ttl = 64
//! multicast_interface = "0.0.0.0"
//!
//! [sketch]
//! name = "udp-echo"
//! udp_port = 7777
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub datagram: DatagramConfig,
    #[serde(default)]
    pub sketch: SketchConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Sleep between system ticks. Zero only yields the thread.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u32,
    #[serde(default)]
    pub run_once: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            run_once: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// Inbound buffer per connection.
    #[serde(default = "default_stream_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u32,
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_stream_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatagramConfig {
    /// Size of both the inbound and the outbound buffer.
    #[serde(default = "default_datagram_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_ttl")]
    pub ttl: Option<u32>,
    #[serde(default)]
    pub multicast_interface: Option<Ipv4Addr>,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_datagram_capacity(),
            ttl: default_ttl(),
            multicast_interface: None,
        }
    }
}

/// Sketches the binary knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchKind {
    Blink,
    Counter,
    UdpEcho,
}

impl SketchKind {
    pub const NAMES: [&'static str; 3] = ["blink", "counter", "udp-echo"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blink" => Some(SketchKind::Blink),
            "counter" => Some(SketchKind::Counter),
            "udp-echo" => Some(SketchKind::UdpEcho),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SketchConfig {
    #[serde(default = "default_sketch_name")]
    pub name: String,
    #[serde(default = "default_blink_period_ms")]
    pub blink_period_ms: u32,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            name: default_sketch_name(),
            blink_period_ms: default_blink_period_ms(),
            udp_port: default_udp_port(),
        }
    }
}

fn default_tick_interval_ms() -> u32 { 1 }
fn default_stream_capacity() -> usize { 65536 }
fn default_connect_timeout_ms() -> u32 { 5000 }
fn default_true() -> bool { true }
fn default_datagram_capacity() -> usize { 2048 }
fn default_ttl() -> Option<u32> { Some(64) }
fn default_sketch_name() -> String { "blink".to_string() }
fn default_blink_period_ms() -> u32 { 500 }
fn default_udp_port() -> u16 { 7777 }

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| {
            tracing::error!("Failed to parse config TOML: {}", e);
            ConfigError::Toml(e)
        })
    }

    pub fn sketch_kind(&self) -> Option<SketchKind> {
        SketchKind::from_name(&self.sketch.name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stream.buffer_capacity must be positive".to_string(),
            ));
        }
        if self.datagram.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "datagram.buffer_capacity must be positive".to_string(),
            ));
        }
        if self.datagram.ttl == Some(0) {
            return Err(ConfigError::Invalid("datagram.ttl must be positive".to_string()));
        }
        if self.sketch_kind().is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown sketch '{}' (expected one of {})",
                self.sketch.name,
                SketchKind::NAMES.join(", ")
            )));
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Config::from_toml_str(&contents),
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
