//! Enumerations used throughout the synchronization layer.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chart resolution
// ---------------------------------------------------------------------------

/// Chart resolution (the backend's `timeframe` value).
///
/// Each resolution has two widths: the nominal period of one historical
/// candle, and the narrower live bucket used when aggregating trade ticks so
/// the newest part of the chart keeps moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Daily candles, live buckets of one minute.
    #[serde(rename = "d")]
    Day,
    /// Weekly candles, live buckets of five minutes.
    #[serde(rename = "w")]
    Week,
    /// Monthly candles, live buckets of one hour.
    #[serde(rename = "m")]
    Month,
}

impl Resolution {
    /// All resolutions, finest first.
    pub const ALL: [Resolution; 3] = [Resolution::Day, Resolution::Week, Resolution::Month];

    /// Bucket width in seconds for live trade aggregation.
    pub const fn live_bucket_secs(self) -> i64 {
        match self {
            Self::Day => 60,
            Self::Week => 300,
            Self::Month => 3_600,
        }
    }

    /// Nominal length of one historical candle in seconds.
    ///
    /// A month is approximated as 30 days.
    pub const fn period_secs(self) -> i64 {
        match self {
            Self::Day => 86_400,
            Self::Week => 604_800,
            Self::Month => 2_592_000,
        }
    }

    /// Wire representation (`"d"`, `"w"`, `"m"`).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "d",
            Self::Week => "w",
            Self::Month => "m",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Resolution {
    type Err = crate::MxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "d" | "day" => Ok(Self::Day),
            "w" | "week" => Ok(Self::Week),
            "m" | "month" => Ok(Self::Month),
            other => Err(crate::MxError::Parse(format!("unknown resolution: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Whether an instrument's data is currently being kept up to date.
///
/// `Stale` means the values are the last REST snapshot (or the last streamed
/// values before a disconnect) and must not be presented as live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Live,
    Stale,
}
