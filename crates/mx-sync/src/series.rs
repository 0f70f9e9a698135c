//! Candle series store for one (instrument, resolution).
//!
//! Candles are kept strictly ascending by bucket time with no duplicate keys.
//! Historical loads replace the series; live candles are upserted in place.

use mx_core::{Candle, Resolution, time_util};
use tracing::warn;

/// Ordered candles for one (instrument, resolution).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole series with `candles`.
    ///
    /// Input may be unsorted and contain repeated keys; the last occurrence of
    /// a key wins. Unplottable candles are dropped, the rest normalized.
    pub fn load(&mut self, candles: Vec<Candle>) {
        let total = candles.len();
        let mut valid: Vec<Candle> = candles
            .into_iter()
            .filter(Candle::is_plottable)
            .map(Candle::normalized)
            .collect();
        if valid.len() < total {
            warn!(
                "[series] dropped {} unplottable candles out of {total}",
                total - valid.len()
            );
        }

        // Stable sort keeps input order among equal keys.
        valid.sort_by_key(|c| c.time);
        let mut out: Vec<Candle> = Vec::with_capacity(valid.len());
        for c in valid {
            match out.last_mut() {
                Some(last) if last.time == c.time => *last = c,
                _ => out.push(c),
            }
        }
        self.candles = out;
    }

    /// Insert or replace the candle with the same bucket time.
    ///
    /// Returns `false` (and logs) when the candle is rejected.
    pub fn upsert(&mut self, candle: Candle) -> bool {
        if !candle.is_plottable() {
            warn!("[series] rejected unplottable {candle}");
            return false;
        }
        let candle = candle.normalized();
        match self.candles.binary_search_by_key(&candle.time, |c| c.time) {
            Ok(i) => self.candles[i] = candle,
            Err(i) => self.candles.insert(i, candle),
        }
        true
    }

    /// Quote-driven price update used while no trade ticks are flowing.
    ///
    /// - no candles: nothing to extend, returns `None`
    /// - last candle younger than one `resolution` period and price within
    ///   `divergence_pct` of its close: close/high/low updated in place
    /// - otherwise: a flat candle at `price`, keyed to `now_secs` aligned to
    ///   the live bucket width, is appended (in-place update if that key would
    ///   not extend the series)
    ///
    /// Returns the candle that changed.
    pub fn apply_price_fallback(
        &mut self,
        price: f64,
        now_secs: i64,
        resolution: Resolution,
        divergence_pct: f64,
    ) -> Option<Candle> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        let last = *self.candles.last()?;

        let fresh = now_secs - last.time < resolution.period_secs();
        let diverged = last.close > 0.0
            && ((price - last.close) / last.close * 100.0).abs() > divergence_pct;
        let key = time_util::align_down(now_secs, resolution.live_bucket_secs());

        if (fresh && !diverged) || key <= last.time {
            let updated = Candle {
                close: price,
                high: last.high.max(price),
                low: last.low.min(price),
                ..last
            };
            let idx = self.candles.len() - 1;
            self.candles[idx] = updated;
            return Some(updated);
        }

        let synthetic = Candle::flat(key, price, None);
        if self.upsert(synthetic) {
            Some(synthetic)
        } else {
            None
        }
    }

    /// Candles in ascending time order.
    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400;

    fn c(time: i64, o: f64, h: f64, l: f64, cl: f64) -> Candle {
        Candle {
            time,
            open: o,
            high: h,
            low: l,
            close: cl,
            volume: Some(1.0),
        }
    }

    fn assert_strictly_ascending(s: &CandleSeries) {
        for pair in s.candles().windows(2) {
            assert!(pair[0].time < pair[1].time, "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn load_sorts_and_keeps_last_duplicate() {
        let mut s = CandleSeries::new();
        s.load(vec![
            c(2 * DAY, 3.0, 3.0, 3.0, 3.0),
            c(0, 1.0, 1.0, 1.0, 1.0),
            c(DAY, 2.0, 2.0, 2.0, 2.0),
            c(0, 9.0, 9.0, 9.0, 9.0),
        ]);
        assert_eq!(s.len(), 3);
        assert_strictly_ascending(&s);
        assert_eq!(s.candles()[0].close, 9.0);
    }

    #[test]
    fn load_drops_invalid_and_normalizes() {
        let mut s = CandleSeries::new();
        s.load(vec![
            c(1_700_000_000_000, 1.0, 1.0, 1.0, 1.0),
            c(DAY, f64::NAN, 1.0, 1.0, 1.0),
            Candle {
                volume: Some(-4.0),
                ..c(0, 5.0, 4.0, 6.0, 5.5)
            },
        ]);
        assert_eq!(s.len(), 1);
        let only = s.candles()[0];
        assert_eq!(only.high, 5.5);
        assert_eq!(only.low, 5.0);
        assert_eq!(only.volume, Some(0.0));
    }

    #[test]
    fn load_replaces_previous_series() {
        let mut s = CandleSeries::new();
        s.load(vec![c(0, 1.0, 1.0, 1.0, 1.0), c(DAY, 1.0, 1.0, 1.0, 1.0)]);
        s.load(vec![c(5 * DAY, 2.0, 2.0, 2.0, 2.0)]);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn upserts_never_duplicate_and_never_shrink() {
        let mut s = CandleSeries::new();
        s.load(vec![c(0, 1.0, 1.0, 1.0, 1.0), c(120, 1.0, 1.0, 1.0, 1.0)]);
        let loaded = s.len();

        for t in [60, 120, 180, 60, 0, 240, 180] {
            assert!(s.upsert(c(t, 2.0, 2.0, 2.0, 2.0)));
            assert!(s.len() >= loaded);
            assert_strictly_ascending(&s);
        }
        assert_eq!(s.len(), 5);
        assert!(s.candles().iter().all(|c| c.close == 2.0));
    }

    #[test]
    fn upsert_rejects_millisecond_keys() {
        let mut s = CandleSeries::new();
        assert!(!s.upsert(c(1_700_000_000_000, 1.0, 1.0, 1.0, 1.0)));
        assert!(!s.upsert(c(-60, 1.0, 1.0, 1.0, 1.0)));
        assert!(s.is_empty());
    }

    #[test]
    fn fallback_without_series_does_nothing() {
        let mut s = CandleSeries::new();
        assert!(s.apply_price_fallback(10.0, 1_000, Resolution::Day, 5.0).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn fallback_updates_fresh_last_candle_in_place() {
        let mut s = CandleSeries::new();
        s.load(vec![c(0, 100.0, 102.0, 99.0, 101.0), c(DAY, 101.0, 103.0, 100.0, 102.0)]);

        let updated = s
            .apply_price_fallback(104.0, DAY + 3_600, Resolution::Day, 5.0)
            .unwrap();
        assert_eq!(updated.time, DAY);
        assert_eq!(updated.open, 101.0);
        assert_eq!(updated.close, 104.0);
        assert_eq!(updated.high, 104.0);
        assert_eq!(updated.low, 100.0);
        assert_eq!(s.len(), 2);

        s.apply_price_fallback(99.5, DAY + 3_700, Resolution::Day, 5.0);
        assert_eq!(s.last().unwrap().low, 99.5);
        assert_eq!(s.last().unwrap().high, 104.0);
    }

    #[test]
    fn fallback_appends_after_a_full_period() {
        let mut s = CandleSeries::new();
        s.load(vec![c(0, 100.0, 100.0, 100.0, 100.0)]);
        let now = 3 * DAY + 125;

        let added = s.apply_price_fallback(101.0, now, Resolution::Day, 5.0).unwrap();
        assert_eq!(added.time, 3 * DAY + 120);
        assert_eq!(added.open, 101.0);
        assert_eq!(added.volume, None);
        assert_eq!(s.len(), 2);
        assert_eq!(s.candles()[0].close, 100.0);
        assert_strictly_ascending(&s);
    }

    #[test]
    fn fallback_appends_on_divergence() {
        let mut s = CandleSeries::new();
        s.load(vec![c(DAY, 100.0, 100.0, 100.0, 100.0)]);
        let now = DAY + 7_200;

        let added = s.apply_price_fallback(110.0, now, Resolution::Day, 5.0).unwrap();
        assert_eq!(added.time, now);
        assert_eq!(s.len(), 2);
        assert_eq!(s.candles()[0].close, 100.0);

        // Within threshold of the new close: updated in place.
        s.apply_price_fallback(111.0, now + 10, Resolution::Day, 5.0);
        assert_eq!(s.len(), 2);
        assert_eq!(s.last().unwrap().close, 111.0);
    }

    #[test]
    fn fallback_ignores_bad_prices() {
        let mut s = CandleSeries::new();
        s.load(vec![c(0, 1.0, 1.0, 1.0, 1.0)]);
        assert!(s.apply_price_fallback(0.0, 10, Resolution::Day, 5.0).is_none());
        assert!(s.apply_price_fallback(f64::NAN, 10, Resolution::Day, 5.0).is_none());
        assert_eq!(s.last().unwrap().close, 1.0);
    }
}
