//! Trade aggregator: rolling per-instrument tick window bucketed into OHLCV
//! candles.
//!
//! # Bucketing
//!
//! ```text
//! bucket_start = floor(tick_secs / width) * width
//! open   = earliest tick by timestamp (ties: earlier arrival)
//! close  = latest tick by timestamp  (ties: later arrival)
//! high   = max price, low = min price
//! volume = sum of volumes
//! ```
//!
//! Ordering by true timestamp makes the result independent of arrival order:
//! a late tick widens high/low and adds volume but never regresses close.
//!
//! Ticks are held sorted by `(timestamp, arrival)`, so pruning only pops from
//! the front. Buckets at the active width keep running accumulators; a bucket
//! that loses ticks to pruning is refolded from the window the next time it
//! is read.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use mx_core::{Candle, TradeTick, time_util};

/// Ticks stamped further ahead of the local clock than this are rejected.
pub const MAX_CLOCK_SKEW_MS: u64 = 60_000;

type OrderKey = (u64, u64);

#[derive(Debug, Clone, Copy)]
struct WindowTick {
    tick: TradeTick,
    /// Arrival sequence, used only to break timestamp ties.
    seq: u64,
}

impl WindowTick {
    fn order_key(&self) -> OrderKey {
        (self.tick.timestamp_ms, self.seq)
    }

    fn bucket(&self, width: i64) -> i64 {
        time_util::align_down(time_util::ms_to_secs(self.tick.timestamp_ms), width)
    }
}

/// Running OHLCV of one bucket.
#[derive(Debug, Clone, Copy)]
struct BucketAgg {
    open: (OrderKey, f64),
    close: (OrderKey, f64),
    high: f64,
    low: f64,
    volume: f64,
}

impl BucketAgg {
    fn new(t: &WindowTick) -> Self {
        let price = t.tick.price;
        Self {
            open: (t.order_key(), price),
            close: (t.order_key(), price),
            high: price,
            low: price,
            volume: t.tick.volume,
        }
    }

    fn add(&mut self, t: &WindowTick) {
        let key = t.order_key();
        let price = t.tick.price;
        if key < self.open.0 {
            self.open = (key, price);
        }
        if key > self.close.0 {
            self.close = (key, price);
        }
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += t.tick.volume;
    }

    fn candle(&self, start: i64) -> Candle {
        Candle {
            time: start,
            open: self.open.1,
            high: self.high,
            low: self.low,
            close: self.close.1,
            volume: Some(self.volume),
        }
    }
}

fn accumulate(buckets: &mut BTreeMap<i64, BucketAgg>, width: i64, t: &WindowTick) {
    buckets
        .entry(t.bucket(width))
        .and_modify(|b| b.add(t))
        .or_insert_with(|| BucketAgg::new(t));
}

/// Trade ticks for one instrument, bounded to a rolling time window.
#[derive(Debug, Clone)]
pub struct TickWindow {
    window_ms: u64,
    /// Sorted by `(timestamp, arrival)`.
    ticks: VecDeque<WindowTick>,
    next_seq: u64,
    /// Width the accumulators are kept at; 0 while no chart reads them.
    width: i64,
    buckets: BTreeMap<i64, BucketAgg>,
    /// Bucket that lost ticks to pruning and must be refolded before use.
    stale_bucket: Option<i64>,
}

impl TickWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            ticks: VecDeque::new(),
            next_seq: 0,
            width: 0,
            buckets: BTreeMap::new(),
            stale_bucket: None,
        }
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn clear(&mut self) {
        self.ticks.clear();
        self.buckets.clear();
        self.stale_bucket = None;
    }

    /// Insert a tick and prune everything older than the window relative to
    /// the newest tick, never later than `now_ms`.
    ///
    /// Returns whether the tick is held. Ticks stamped more than
    /// [`MAX_CLOCK_SKEW_MS`] ahead of `now_ms` are rejected, as are ticks
    /// already older than the window.
    pub fn push(&mut self, tick: TradeTick, now_ms: u64) -> bool {
        if tick.timestamp_ms > now_ms.saturating_add(MAX_CLOCK_SKEW_MS) {
            return false;
        }
        let entry = WindowTick {
            tick: TradeTick {
                volume: if tick.volume.is_finite() { tick.volume.max(0.0) } else { 0.0 },
                ..tick
            },
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let key = entry.order_key();
        if self.ticks.back().is_none_or(|last| last.order_key() < key) {
            self.ticks.push_back(entry);
        } else {
            let at = self.ticks.partition_point(|t| t.order_key() < key);
            self.ticks.insert(at, entry);
        }
        if self.width > 0 {
            accumulate(&mut self.buckets, self.width, &entry);
        }

        let newest = self.ticks.back().map_or(0, |t| t.tick.timestamp_ms);
        let cutoff = newest.min(now_ms).saturating_sub(self.window_ms);
        self.prune(cutoff);
        entry.tick.timestamp_ms >= cutoff
    }

    /// Push `tick` and return the candle of the bucket it falls in, or `None`
    /// when the tick was rejected or is outside the window at `now_ms`.
    pub fn ingest(&mut self, tick: TradeTick, width: i64, now_ms: u64) -> Option<Candle> {
        self.set_width(width);
        if !self.push(tick, now_ms) {
            return None;
        }
        let start = time_util::align_down(time_util::ms_to_secs(tick.timestamp_ms), self.width);
        self.bucket(start, width, now_ms)
    }

    /// Whether any tick lies inside the window ending at `now_ms`.
    pub fn has_ticks_at(&self, now_ms: u64) -> bool {
        let cutoff = self.cutoff(now_ms);
        self.ticks.back().is_some_and(|t| t.tick.timestamp_ms >= cutoff)
    }

    /// Candle for the bucket starting at `start`, built from every tick in
    /// the window at `now_ms`.
    pub fn bucket(&mut self, start: i64, width: i64, now_ms: u64) -> Option<Candle> {
        self.set_width(width);
        self.prune(self.cutoff(now_ms));
        if self.stale_bucket == Some(start) {
            self.stale_bucket = None;
            self.refold(start);
        }
        self.buckets.get(&start).map(|b| b.candle(start))
    }

    /// Rebuild every bucket in the window at `width`, ascending by time.
    pub fn aggregate_all(&mut self, width: i64, now_ms: u64) -> Vec<Candle> {
        self.set_width(width);
        self.prune(self.cutoff(now_ms));
        if let Some(start) = self.stale_bucket.take() {
            self.refold(start);
        }
        self.buckets
            .iter()
            .map(|(start, agg)| agg.candle(*start))
            .collect()
    }

    fn cutoff(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.window_ms)
    }

    /// Keep accumulators at `width`, rebuilding them when it changes.
    fn set_width(&mut self, width: i64) {
        let width = width.max(1);
        if width == self.width {
            return;
        }
        self.width = width;
        self.buckets.clear();
        self.stale_bucket = None;
        for t in &self.ticks {
            accumulate(&mut self.buckets, width, t);
        }
    }

    fn prune(&mut self, cutoff: u64) {
        let mut last_popped = None;
        while let Some(front) = self.ticks.front() {
            if front.tick.timestamp_ms >= cutoff {
                break;
            }
            last_popped = Some(front.bucket(self.width));
            self.ticks.pop_front();
        }
        if self.width == 0 {
            return;
        }
        let Some(last_popped) = last_popped else {
            return;
        };

        let Some(front_bucket) = self.ticks.front().map(|t| t.bucket(self.width)) else {
            self.buckets.clear();
            self.stale_bucket = None;
            return;
        };
        self.buckets = self.buckets.split_off(&front_bucket);
        if last_popped == front_bucket {
            self.stale_bucket = Some(front_bucket);
        } else if self.stale_bucket.is_some_and(|s| s < front_bucket) {
            self.stale_bucket = None;
        }
    }

    /// Recompute one bucket from the ticks still held.
    fn refold(&mut self, start: i64) {
        let width = self.width;
        let lo = self.ticks.partition_point(|t| t.bucket(width) < start);
        let hi = self.ticks.partition_point(|t| t.bucket(width) <= start);

        let mut agg: Option<BucketAgg> = None;
        for t in self.ticks.range(lo..hi) {
            match agg.as_mut() {
                Some(a) => a.add(t),
                None => agg = Some(BucketAgg::new(t)),
            }
        }
        match agg {
            Some(agg) => {
                self.buckets.insert(start, agg);
            }
            None => {
                self.buckets.remove(&start);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3_600);

    fn tick(secs: u64, price: f64, volume: f64) -> TradeTick {
        TradeTick::new(price, volume, secs * 1_000)
    }

    /// Push as a live feed would: the clock reads the tick's own time.
    fn push_live(w: &mut TickWindow, t: TradeTick) -> bool {
        w.push(t, t.timestamp_ms)
    }

    #[test]
    fn day_chart_scenario() {
        let mut w = TickWindow::new(HOUR);
        let now = 61_000;
        w.ingest(tick(0, 100.0, 10.0), 60, now);
        w.ingest(tick(30, 105.0, 5.0), 60, now);
        let last = w.ingest(tick(61, 103.0, 8.0), 60, now).unwrap();

        assert_eq!(last, Candle {
            time: 60,
            open: 103.0,
            high: 103.0,
            low: 103.0,
            close: 103.0,
            volume: Some(8.0),
        });

        let first = w.bucket(0, 60, now).unwrap();
        assert_eq!(first, Candle {
            time: 0,
            open: 100.0,
            high: 105.0,
            low: 100.0,
            close: 105.0,
            volume: Some(15.0),
        });

        assert_eq!(w.aggregate_all(60, now), vec![first, last]);
    }

    #[test]
    fn arrival_order_does_not_change_the_candle() {
        let ticks = [
            tick(5, 10.0, 1.0),
            tick(12, 12.0, 2.0),
            tick(20, 9.0, 3.0),
            tick(41, 11.0, 4.0),
        ];
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];

        let mut results = Vec::new();
        for order in orders {
            let mut w = TickWindow::new(HOUR);
            let mut last = None;
            for i in order {
                last = w.ingest(ticks[i], 60, 60_000);
            }
            results.push(last.unwrap());
        }
        for c in &results {
            assert_eq!(*c, results[0]);
        }
        assert_eq!(results[0].open, 10.0);
        assert_eq!(results[0].close, 11.0);
        assert_eq!(results[0].volume, Some(10.0));
    }

    #[test]
    fn late_tick_never_regresses_close() {
        let mut w = TickWindow::new(HOUR);
        w.ingest(tick(50, 20.0, 1.0), 60, 60_000);
        let c = w.ingest(tick(10, 30.0, 1.0), 60, 60_000).unwrap();
        assert_eq!(c.close, 20.0);
        assert_eq!(c.open, 30.0);
        assert_eq!(c.high, 30.0);
    }

    #[test]
    fn timestamp_ties_break_by_arrival() {
        let mut w = TickWindow::new(HOUR);
        w.ingest(tick(7, 1.0, 0.0), 60, 60_000);
        let c = w.ingest(tick(7, 2.0, 0.0), 60, 60_000).unwrap();
        assert_eq!(c.open, 1.0);
        assert_eq!(c.close, 2.0);
    }

    #[test]
    fn candles_satisfy_ohlc_bounds() {
        let mut w = TickWindow::new(HOUR);
        let prices = [5.0, 7.5, 3.25, 6.0, 4.0, 9.0, 1.0];
        for (i, p) in prices.iter().enumerate() {
            push_live(&mut w, tick(i as u64 * 13, *p, 1.0));
        }
        for c in w.aggregate_all(60, 120_000) {
            assert!(c.high >= c.open.max(c.close));
            assert!(c.low <= c.open.min(c.close));
        }
    }

    #[test]
    fn window_prunes_relative_to_newest_tick() {
        let mut w = TickWindow::new(Duration::from_secs(60));
        push_live(&mut w, tick(0, 1.0, 1.0));
        push_live(&mut w, tick(30, 1.0, 1.0));
        assert_eq!(w.len(), 2);
        push_live(&mut w, tick(100, 1.0, 1.0));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn reads_exclude_ticks_older_than_the_window_at_now() {
        let mut w = TickWindow::new(Duration::from_secs(60));
        push_live(&mut w, tick(0, 1.0, 1.0));
        assert!(w.has_ticks_at(30_000));
        assert!(!w.has_ticks_at(200_000));
        assert!(w.bucket(0, 60, 200_000).is_none());
        assert!(w.aggregate_all(60, 200_000).is_empty());
        assert!(w.is_empty());
    }

    #[test]
    fn pruning_refolds_a_partially_expired_bucket() {
        let mut w = TickWindow::new(Duration::from_secs(60));
        w.ingest(tick(0, 50.0, 1.0), 60, 0);
        w.ingest(tick(40, 10.0, 2.0), 60, 40_000);
        w.ingest(tick(59, 20.0, 3.0), 60, 59_000);

        // At t=90 the tick at 0 has left the window; bucket 0 keeps 40 and 59.
        let c = w.bucket(0, 60, 90_000).unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (10.0, 20.0, 10.0, 20.0));
        assert_eq!(c.volume, Some(5.0));
    }

    #[test]
    fn future_stamped_tick_is_rejected() {
        let now = 1_700_000_000_000;
        let mut w = TickWindow::new(HOUR);
        assert!(w.ingest(TradeTick::new(1.0, 1.0, 100_000_000_000_000_000), 60, now).is_none());
        assert!(w.is_empty());

        let c = w.ingest(TradeTick::new(2.0, 1.0, now), 60, now).unwrap();
        assert_eq!(c.close, 2.0);
        assert_eq!(w.len(), 1);
        assert!(!w.has_ticks_at(now + 86_400_000));
    }

    #[test]
    fn slightly_early_clock_is_tolerated() {
        let now = 1_700_000_000_000;
        let mut w = TickWindow::new(HOUR);
        assert!(w.push(TradeTick::new(1.0, 1.0, now + 5_000), now));
        assert!(w.push(TradeTick::new(1.0, 1.0, now), now));
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn negative_volume_is_clamped() {
        let mut w = TickWindow::new(HOUR);
        w.ingest(tick(1, 1.0, 4.0), 60, 60_000);
        let c = w.ingest(tick(2, 1.0, -10.0), 60, 60_000).unwrap();
        assert_eq!(c.volume, Some(4.0));
    }

    #[test]
    fn re_aggregation_at_wider_width() {
        let mut w = TickWindow::new(HOUR);
        for s in [0, 61, 130, 290, 310] {
            push_live(&mut w, tick(s, s as f64 + 1.0, 1.0));
        }
        assert_eq!(w.aggregate_all(60, 400_000).len(), 5);

        let wide = w.aggregate_all(300, 400_000);
        assert_eq!(wide.len(), 2);
        assert_eq!(wide[0].time, 0);
        assert_eq!(wide[0].open, 1.0);
        assert_eq!(wide[0].close, 291.0);
        assert_eq!(wide[0].volume, Some(4.0));
        assert_eq!(wide[1].time, 300);
    }

    #[test]
    fn full_hour_of_ticks_stays_bounded() {
        let start_ms = 1_700_000_000_000;
        let mut w = TickWindow::new(HOUR);
        let mut last = None;
        for i in 0..120_000u64 {
            let ts = start_ms + i * 60;
            last = w.ingest(TradeTick::new(100.0 + (i % 7) as f64, 1.0, ts), 3_600, ts);
        }
        let newest = start_ms + 119_999 * 60;
        assert!(w.len() <= 60_001);
        assert!(last.is_some());

        let all = w.aggregate_all(3_600, newest);
        let total: f64 = all.iter().filter_map(|c| c.volume).sum();
        assert_eq!(total, w.len() as f64);
    }
}
