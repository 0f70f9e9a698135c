//! Quote merger: partial-field updates into one per-instrument [`Quote`].
//!
//! Two entry points:
//! - [`apply_snapshot`] — a quote broadcast; only provided fields change.
//! - [`apply_trade`] — a trade tick used as a price update when nothing is
//!   aggregating ticks for the instrument.
//!
//! Both leave absent fields untouched; nothing is ever reset to zero.

use mx_core::{Quote, QuoteUpdate, TradeTick};

/// Overwrite only the fields present in `update`. Nothing is recomputed.
pub fn apply_snapshot(quote: &mut Quote, update: &QuoteUpdate) {
    if let Some(v) = update.price {
        quote.price = v;
    }
    if let Some(v) = update.open {
        quote.open = Some(v);
    }
    if let Some(v) = update.high {
        quote.high = Some(v);
    }
    if let Some(v) = update.low {
        quote.low = Some(v);
    }
    if let Some(v) = update.previous_close {
        quote.previous_close = Some(v);
    }
    if let Some(v) = update.change {
        quote.change = v;
    }
    if let Some(v) = update.change_percent {
        quote.change_percent = v;
    }
    if let Some(v) = update.volume {
        quote.volume = v;
    }
    if let Some(v) = update.timestamp_ms {
        quote.timestamp_ms = v;
    }
}

/// Fold a trade tick into the quote as a price update.
///
/// Change fields are derived from the previous close (zero without one),
/// high/low are running extrema, open is set once, and volume only grows.
pub fn apply_trade(quote: &mut Quote, tick: &TradeTick) {
    let price = tick.price;
    quote.price = price;

    match quote.previous_close {
        Some(prev) if prev > 0.0 => {
            quote.change = price - prev;
            quote.change_percent = quote.change / prev * 100.0;
        }
        _ => {
            quote.change = 0.0;
            quote.change_percent = 0.0;
        }
    }

    quote.high = Some(quote.high.map_or(price, |h| h.max(price)));
    quote.low = Some(quote.low.map_or(price, |l| l.min(price)));
    if quote.open.is_none() {
        quote.open = Some(price);
    }

    if tick.volume > 0.0 {
        quote.volume = quote.volume.max(tick.volume);
    }
    quote.timestamp_ms = quote.timestamp_ms.max(tick.timestamp_ms);
}
