//! Configuration parsing for the mx synchronization layer.
//!
//! The runner reads its settings from a single JSON file. Only `stream.url`
//! is mandatory; every other block falls back to defaults.
//!
//! # Example config
//!
//! ```json
//! {
//!   "app": { "module_name": "mx-runner", "log_path": "/tmp/log", "log_json": false },
//!   "stream": { "url": "ws://localhost:8080/ws", "token_env": "MX_ACCESS_TOKEN" },
//!   "rest": { "base_url": "http://localhost:8080" },
//!   "reconnect": { "initial_backoff_ms": 500, "max_backoff_ms": 30000, "max_retries": 10 },
//!   "aggregation": { "window_secs": 3600, "divergence_pct": 5.0 },
//!   "instruments": ["AAPL", "TSLA"],
//!   "index_topic": true,
//!   "chart": { "instrument": "AAPL", "resolution": "d" }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::{MxError, Resolution};

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    #[serde(default)]
    pub app: ModuleMeta,

    /// Streaming connection settings.
    pub stream: StreamConfig,

    /// REST collaborator settings. Absent → no history/quote seeding.
    pub rest: Option<RestConfig>,

    /// Reconnect supervisor settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Trade aggregation and fallback-candle settings.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Instruments to watch on startup.
    #[serde(default)]
    pub instruments: Vec<String>,

    /// Whether to subscribe to the global index broadcast.
    #[serde(default)]
    pub index_topic: bool,

    /// Chart focus on startup (which instrument aggregates ticks, and at
    /// which resolution).
    pub chart: Option<ChartConfig>,
}

/// Module metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
    /// Write log files as JSON lines.
    #[serde(default)]
    pub log_json: bool,
}

impl AppConfig {
    /// Module name used as log file prefix, defaulting to `mx-runner`.
    pub fn module_name(&self) -> String {
        self.app
            .module_name
            .clone()
            .unwrap_or_else(|| "mx-runner".to_string())
    }

    /// Validate cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`MxError::Config`] on an empty stream URL, a zero connect
    /// timeout, a zero aggregation window, or inverted backoff bounds.
    pub fn validate(&self) -> Result<(), MxError> {
        if self.stream.url.trim().is_empty() {
            return Err(MxError::Config("stream.url is empty".to_string()));
        }
        if self.stream.connect_timeout_ms == 0 {
            return Err(MxError::Config(
                "stream.connect_timeout_ms must be positive".to_string(),
            ));
        }
        if self.aggregation.window_secs == 0 {
            return Err(MxError::Config(
                "aggregation.window_secs must be positive".to_string(),
            ));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(MxError::Config(
                "reconnect.initial_backoff_ms exceeds max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Streaming (STOMP over WebSocket) connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Broker WebSocket URL (e.g. `ws://localhost:8080/ws`).
    pub url: String,

    /// Time allowed for the broker to acknowledge `CONNECT` (default 10 s).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Outbound heart-beat interval; 0 disables heart-beats.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Environment variable holding the bearer token, read at every connect.
    pub token_env: Option<String>,

    /// Extra HTTP headers for the WebSocket handshake.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_ms > 0).then(|| Duration::from_millis(self.heartbeat_ms))
    }
}

/// REST collaborator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    /// Backend base URL (e.g. `http://localhost:8080`).
    pub base_url: String,

    /// Per-request timeout (default 10 s).
    #[serde(default = "default_rest_timeout_ms")]
    pub timeout_ms: u64,
}

/// Reconnect supervisor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Disable to leave reconnection entirely to the caller.
    pub enabled: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Attempts per outage before the supervisor gives up.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_retries: 10,
        }
    }
}

/// Trade aggregation and fallback-candle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Rolling tick window per instrument (default 1 hour).
    pub window_secs: u64,
    /// Quote-driven fallback opens a new candle when price moves further
    /// than this percentage away from the last close.
    pub divergence_pct: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: 3_600,
            divergence_pct: 5.0,
        }
    }
}

/// Chart focus on startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartConfig {
    pub instrument: String,
    #[serde(default = "default_resolution")]
    pub resolution: Resolution,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_rest_timeout_ms() -> u64 {
    10_000
}

fn default_resolution() -> Resolution {
    Resolution::Day
}

/// Load, parse and validate a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    Ok(config)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> anyhow::Result<AppConfig> {
    let config: AppConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}
