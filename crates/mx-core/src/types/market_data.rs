//! Market data structures — the records flowing through the reconciliation
//! engine.
//!
//! # Timestamp convention
//!
//! Trade ticks and quotes carry **milliseconds since Unix epoch** (what the
//! stream sends). Candles are keyed by bucket-start **seconds** (what the
//! chart consumes).

use serde::{Deserialize, Serialize};

/// Largest accepted candle timestamp, in seconds. Anything above this is most
/// likely a millisecond value and is rejected rather than plotted in the far
/// future.
pub const MAX_CANDLE_TIME_SECS: i64 = 100_000_000_000;

// ---------------------------------------------------------------------------
// Quote
// ---------------------------------------------------------------------------

/// Current best-known price and volume state for one instrument.
///
/// Optional fields stay `None` until some source provides them; once set they
/// are only ever replaced by another provided value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Quote {
    #[serde(alias = "symbol")]
    pub ticker: String,
    pub price: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub previous_close: Option<f64>,
    pub change: f64,
    pub change_percent: f64,
    pub volume: f64,
    #[serde(alias = "timestamp")]
    pub timestamp_ms: u64,
}

impl Quote {
    /// An empty quote for `ticker`.
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            ..Self::default()
        }
    }
}

/// A partial quote snapshot: `None` means "not provided, keep what you have".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuoteUpdate {
    pub price: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: Option<f64>,
    pub timestamp_ms: Option<u64>,
}

impl From<&Quote> for QuoteUpdate {
    /// Treats a full REST quote as a snapshot. Zero price/volume fields are
    /// considered "not provided" so a thin REST body cannot wipe streamed
    /// values.
    fn from(q: &Quote) -> Self {
        let positive = |v: f64| (v.is_finite() && v > 0.0).then_some(v);
        Self {
            price: positive(q.price),
            open: q.open,
            high: q.high,
            low: q.low,
            previous_close: q.previous_close,
            change: Some(q.change).filter(|v| v.is_finite()),
            change_percent: Some(q.change_percent).filter(|v| v.is_finite()),
            volume: positive(q.volume),
            timestamp_ms: (q.timestamp_ms > 0).then_some(q.timestamp_ms),
        }
    }
}

/// Lightweight projection of a quote used by list-style displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastPrice {
    pub ticker: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: f64,
    pub timestamp_ms: u64,
}

impl From<&Quote> for LastPrice {
    fn from(q: &Quote) -> Self {
        Self {
            ticker: q.ticker.clone(),
            price: q.price,
            change: q.change,
            change_percent: q.change_percent,
            volume: q.volume,
            timestamp_ms: q.timestamp_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Trade tick
// ---------------------------------------------------------------------------

/// A single observed trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeTick {
    pub price: f64,
    pub volume: f64,
    pub timestamp_ms: u64,
}

impl TradeTick {
    pub fn new(price: f64, volume: f64, timestamp_ms: u64) -> Self {
        Self {
            price,
            volume,
            timestamp_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// One OHLCV bucket, keyed by its start time in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(alias = "timestamp")]
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl Candle {
    /// A flat candle where every price equals `price`.
    pub fn flat(time: i64, price: f64, volume: Option<f64>) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// Whether the candle can be placed on a chart at all: finite prices and
    /// a bucket time inside `[0, MAX_CANDLE_TIME_SECS)`.
    pub fn is_plottable(&self) -> bool {
        (0..MAX_CANDLE_TIME_SECS).contains(&self.time)
            && [self.open, self.high, self.low, self.close]
                .iter()
                .all(|v| v.is_finite())
    }

    /// Returns a copy with the OHLC invariants restored: high covers
    /// open/close, low is covered by them, negative volume becomes zero.
    pub fn normalized(mut self) -> Self {
        self.high = self.high.max(self.open).max(self.close);
        self.low = self.low.min(self.open).min(self.close);
        self.volume = self.volume.map(|v| if v.is_finite() && v > 0.0 { v } else { 0.0 });
        self
    }
}

/// Historical candles for one (instrument, resolution), as fetched over REST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleBatch {
    #[serde(alias = "symbol", alias = "instrument")]
    pub ticker: String,
    #[serde(alias = "timeframe")]
    pub resolution: super::Resolution,
    #[serde(default)]
    pub items: Vec<Candle>,
}

// ---------------------------------------------------------------------------
// Display impls
// ---------------------------------------------------------------------------

impl std::fmt::Display for Quote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Quote({} {:.4} chg={:+.4} ({:+.2}%) vol={:.0})",
            self.ticker, self.price, self.change, self.change_percent, self.volume
        )
    }
}

impl std::fmt::Display for Candle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Candle(t={} o={:.4} h={:.4} l={:.4} c={:.4})",
            self.time, self.open, self.high, self.low, self.close
        )
    }
}
