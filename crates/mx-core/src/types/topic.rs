//! Topic naming for the streaming connection.
//!
//! Per-instrument trade/quote updates are published on
//! `/topic/stock/{SYMBOL}`; index-level updates share one global broadcast
//! topic and carry their instrument in the payload.

/// Prefix of per-instrument topics.
pub const STOCK_TOPIC_PREFIX: &str = "/topic/stock/";

/// Global index broadcast topic.
pub const INDEX_TOPIC: &str = "/topic/index";

/// Topic carrying trade ticks and quotes for `symbol`.
#[inline]
pub fn instrument_topic(symbol: &str) -> String {
    format!("{STOCK_TOPIC_PREFIX}{}", symbol.trim().to_ascii_uppercase())
}

/// Extract the instrument symbol from a per-instrument topic.
///
/// Returns `None` for the index topic or any foreign topic.
#[inline]
pub fn symbol_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(STOCK_TOPIC_PREFIX)
        .filter(|s| !s.is_empty() && !s.contains('/'))
}
