//! Stream payload classifier.
//!
//! Turns the body of a `MESSAGE` frame into a [`Classified`] value. The
//! discriminator is the `type` field:
//!
//! - `"quote"` → [`QuoteMessage`] (partial full-quote snapshot)
//! - anything else, or absent → [`TradeMessage`] (single trade tick)
//!
//! Nothing downstream ever looks at raw JSON; a payload that cannot be
//! classified becomes [`Classified::Malformed`] and is dropped by the caller.

use mx_core::{QuoteUpdate, TradeTick, symbol_from_topic, time_util};

use crate::json_util::{parse_f64_field, parse_u64_field, str_field};

/// Keys that may carry the instrument symbol.
const TICKER_KEYS: &[&str] = &["ticker", "symbol", "code"];

/// A quote snapshot for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteMessage {
    pub instrument: String,
    pub update: QuoteUpdate,
}

/// A trade tick for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeMessage {
    pub instrument: String,
    pub tick: TradeTick,
}

/// Result of classifying one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Quote(QuoteMessage),
    Trade(TradeMessage),
    Malformed(String),
}

impl Classified {
    /// Instrument the message applies to, if it was classified.
    pub fn instrument(&self) -> Option<&str> {
        match self {
            Self::Quote(q) => Some(&q.instrument),
            Self::Trade(t) => Some(&t.instrument),
            Self::Malformed(_) => None,
        }
    }
}

/// Classify a payload received on `topic`.
///
/// The instrument is taken from the payload (`ticker`/`symbol`/`code`) and
/// falls back to the symbol encoded in a per-instrument topic; index
/// broadcasts must carry it in the payload. Symbols are upper-cased.
pub fn classify(topic: &str, body: &str) -> Classified {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return Classified::Malformed(format!("invalid json: {e}")),
    };
    if !value.is_object() {
        return Classified::Malformed("payload is not an object".to_string());
    }

    let Some(instrument) = str_field(&value, TICKER_KEYS)
        .or_else(|| symbol_from_topic(topic))
        .map(str::to_ascii_uppercase)
    else {
        return Classified::Malformed(format!("no instrument in payload on {topic}"));
    };

    let is_quote = value
        .get("type")
        .and_then(|t| t.as_str())
        .is_some_and(|t| t.eq_ignore_ascii_case("quote"));

    if is_quote {
        classify_quote(&value, instrument)
    } else {
        classify_trade(&value, instrument)
    }
}

fn classify_quote(v: &serde_json::Value, instrument: String) -> Classified {
    let update = QuoteUpdate {
        price: parse_f64_field(v, &["price", "currentPrice", "lastPrice"]),
        open: parse_f64_field(v, &["open"]),
        high: parse_f64_field(v, &["high"]),
        low: parse_f64_field(v, &["low"]),
        previous_close: parse_f64_field(v, &["previousClose", "prevClose"]),
        change: parse_f64_field(v, &["change"]),
        change_percent: parse_f64_field(v, &["changePercent", "changeRate"]),
        volume: parse_f64_field(v, &["volume"]),
        timestamp_ms: parse_u64_field(v, &["timestamp"]),
    };

    if update == QuoteUpdate::default() {
        return Classified::Malformed(format!("quote for {instrument} carries no fields"));
    }

    Classified::Quote(QuoteMessage { instrument, update })
}

fn classify_trade(v: &serde_json::Value, instrument: String) -> Classified {
    let Some(price) = parse_f64_field(v, &["price", "tradePrice"]) else {
        return Classified::Malformed(format!("trade for {instrument} has no price"));
    };
    if price <= 0.0 {
        return Classified::Malformed(format!("trade for {instrument} has price {price}"));
    }

    // Negative volume is a feed defect; count it as zero rather than
    // subtracting from the bucket.
    let volume = parse_f64_field(v, &["volume", "tradeVolume", "quantity"])
        .map(|vol| vol.max(0.0))
        .unwrap_or(0.0);
    let timestamp_ms =
        parse_u64_field(v, &["timestamp", "tradeTime"]).unwrap_or_else(time_util::now_ms);

    Classified::Trade(TradeMessage {
        instrument,
        tick: TradeTick::new(price, volume, timestamp_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::{INDEX_TOPIC, instrument_topic};

    #[test]
    fn quote_with_partial_fields() {
        let body = r#"{"type":"quote","ticker":"aapl","price":"190.5","volume":1200,"timestamp":1700000000000}"#;
        match classify(&instrument_topic("AAPL"), body) {
            Classified::Quote(q) => {
                assert_eq!(q.instrument, "AAPL");
                assert_eq!(q.update.price, Some(190.5));
                assert_eq!(q.update.volume, Some(1200.0));
                assert_eq!(q.update.open, None);
                assert_eq!(q.update.previous_close, None);
                assert_eq!(q.update.timestamp_ms, Some(1_700_000_000_000));
            }
            other => panic!("expected Quote, got {other:?}"),
        }
    }

    #[test]
    fn missing_or_unknown_type_is_a_trade() {
        let topic = instrument_topic("TSLA");
        for body in [
            r#"{"price": 250.0, "volume": 3, "timestamp": 1700000000123}"#,
            r#"{"type": "trade", "price": 250.0, "volume": 3, "timestamp": 1700000000123}"#,
            r#"{"type": "tick", "price": 250.0, "volume": 3, "timestamp": 1700000000123}"#,
        ] {
            match classify(&topic, body) {
                Classified::Trade(t) => {
                    assert_eq!(t.instrument, "TSLA");
                    assert_eq!(t.tick.price, 250.0);
                    assert_eq!(t.tick.volume, 3.0);
                    assert_eq!(t.tick.timestamp_ms, 1_700_000_000_123);
                }
                other => panic!("expected Trade, got {other:?}"),
            }
        }
    }

    #[test]
    fn index_broadcast_needs_ticker_in_payload() {
        let ok = classify(INDEX_TOPIC, r#"{"type":"quote","symbol":"KOSPI","price":2500}"#);
        assert_eq!(ok.instrument(), Some("KOSPI"));

        let bad = classify(INDEX_TOPIC, r#"{"type":"quote","price":2500}"#);
        assert!(matches!(bad, Classified::Malformed(_)));
    }

    #[test]
    fn negative_volume_is_clamped() {
        match classify(&instrument_topic("X"), r#"{"price": 1, "volume": -5, "timestamp": 1}"#) {
            Classified::Trade(t) => assert_eq!(t.tick.volume, 0.0),
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn missing_timestamp_uses_now() {
        let before = time_util::now_ms();
        match classify(&instrument_topic("X"), r#"{"price": 1}"#) {
            Classified::Trade(t) => assert!(t.tick.timestamp_ms >= before),
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads() {
        let topic = instrument_topic("X");
        for body in [
            "not json",
            "[1,2,3]",
            r#"{"volume": 1}"#,
            r#"{"price": 0}"#,
            r#"{"price": "-3"}"#,
            r#"{"type": "quote"}"#,
        ] {
            assert!(
                matches!(classify(&topic, body), Classified::Malformed(_)),
                "{body} should be malformed"
            );
        }
    }
}
