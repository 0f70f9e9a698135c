//! Per-instrument state: quote, tick window and candle series.
//!
//! One [`InstrumentBook`] sits behind one mutex, so a quote merge, a tick
//! ingest and the series upsert they cause are applied atomically.
//!
//! Precedence between sources for a series:
//! 1. historical `load` replaces the series
//! 2. trade ticks, when the instrument is focused at that resolution, upsert
//!    aggregated buckets
//! 3. quote prices adjust the series only while no tick is inside the window

use std::time::Duration;

use ahash::AHashMap;
use mx_core::{Candle, Quote, QuoteUpdate, Resolution, TradeTick, time_util};
use tracing::warn;

use crate::aggregator::{MAX_CLOCK_SKEW_MS, TickWindow};
use crate::quote;
use crate::series::CandleSeries;

/// What one message changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookUpdate {
    pub quote_changed: bool,
    pub candles: Vec<(Resolution, Candle)>,
}

#[derive(Debug, Clone)]
pub struct InstrumentBook {
    quote: Quote,
    ticks: TickWindow,
    series: AHashMap<Resolution, CandleSeries>,
    /// Chart resolution trades are aggregated at.
    focus: Option<Resolution>,
    /// Topics that delivered data for this instrument.
    topics: Vec<String>,
}

impl InstrumentBook {
    pub fn new(ticker: &str, window: Duration) -> Self {
        Self {
            quote: Quote::new(ticker),
            ticks: TickWindow::new(window),
            series: AHashMap::new(),
            focus: None,
            topics: Vec::new(),
        }
    }

    pub fn focus(&self) -> Option<Resolution> {
        self.focus
    }

    /// Aggregate trades at `resolution` from now on and rebuild the window's
    /// buckets at its width. `None` when already focused there.
    pub fn set_focus(&mut self, resolution: Resolution, now_ms: u64) -> Option<Vec<Candle>> {
        if self.focus == Some(resolution) {
            return None;
        }
        self.focus = Some(resolution);
        Some(self.refocus(resolution, now_ms))
    }

    pub fn clear_focus(&mut self) -> Option<Resolution> {
        self.focus.take()
    }

    pub fn record_topic(&mut self, topic: &str) {
        if !self.fed_by(topic) {
            self.topics.push(topic.to_string());
        }
    }

    pub fn fed_by(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    pub fn quote(&self) -> &Quote {
        &self.quote
    }

    pub fn series(&self, resolution: Resolution) -> Option<&CandleSeries> {
        self.series.get(&resolution)
    }

    /// Whether trade ticks currently drive this instrument.
    pub fn has_live_ticks(&self, now_ms: u64) -> bool {
        self.ticks.has_ticks_at(now_ms)
    }

    /// Apply a trade tick.
    ///
    /// The tick enters the window. With a focused chart it is aggregated
    /// into that series; otherwise it updates the quote. Ticks stamped too
    /// far past `now_ms` change nothing.
    pub fn apply_trade(&mut self, tick: TradeTick, now_ms: u64) -> BookUpdate {
        let mut update = BookUpdate::default();
        if tick.timestamp_ms > now_ms.saturating_add(MAX_CLOCK_SKEW_MS) {
            warn!(
                "[book] {} dropped trade stamped {} ms ahead of the clock",
                self.quote.ticker,
                tick.timestamp_ms - now_ms
            );
            return update;
        }
        match self.focus {
            Some(resolution) => {
                let width = resolution.live_bucket_secs();
                if let Some(candle) = self.ticks.ingest(tick, width, now_ms) {
                    if self.series.entry(resolution).or_default().upsert(candle) {
                        update.candles.push((resolution, candle));
                    }
                }
            }
            None => {
                self.ticks.push(tick, now_ms);
                quote::apply_trade(&mut self.quote, &tick);
                update.quote_changed = true;
            }
        }
        update
    }

    /// Apply a quote snapshot, then let its price adjust every loaded series
    /// while no trade tick is inside the window.
    pub fn apply_quote(
        &mut self,
        snapshot: &QuoteUpdate,
        now_ms: u64,
        divergence_pct: f64,
    ) -> BookUpdate {
        quote::apply_snapshot(&mut self.quote, snapshot);
        let mut update = BookUpdate {
            quote_changed: true,
            candles: Vec::new(),
        };

        let Some(price) = snapshot.price else {
            return update;
        };
        if self.has_live_ticks(now_ms) {
            return update;
        }

        let now_secs = time_util::ms_to_secs(now_ms);
        for (resolution, series) in self.series.iter_mut() {
            if let Some(candle) =
                series.apply_price_fallback(price, now_secs, *resolution, divergence_pct)
            {
                update.candles.push((*resolution, candle));
            }
        }
        update
    }

    /// Install a REST quote as the base record. Zero fields in the snapshot
    /// do not wipe streamed values.
    pub fn seed_quote(&mut self, snapshot: &Quote) {
        quote::apply_snapshot(&mut self.quote, &QuoteUpdate::from(snapshot));
    }

    /// Replace the series at `resolution` with historical candles.
    ///
    /// When the chart is focused at this resolution, buckets aggregated from
    /// the tick window are re-applied on top. Returns the resulting length.
    pub fn load_series(&mut self, resolution: Resolution, candles: Vec<Candle>, now_ms: u64) -> usize {
        let series = self.series.entry(resolution).or_default();
        series.load(candles);
        if self.focus == Some(resolution) {
            for candle in self.ticks.aggregate_all(resolution.live_bucket_secs(), now_ms) {
                series.upsert(candle);
            }
        }
        series.len()
    }

    pub fn upsert_candle(&mut self, resolution: Resolution, candle: Candle) -> bool {
        self.series.entry(resolution).or_default().upsert(candle)
    }

    /// Rebuild every bucket in the window at `resolution`'s width and upsert
    /// them into that series.
    fn refocus(&mut self, resolution: Resolution, now_ms: u64) -> Vec<Candle> {
        let candles = self
            .ticks
            .aggregate_all(resolution.live_bucket_secs(), now_ms);
        if candles.is_empty() {
            return candles;
        }
        let series = self.series.entry(resolution).or_default();
        candles.into_iter().filter(|c| series.upsert(*c)).collect()
    }
}
