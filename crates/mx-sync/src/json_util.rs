//! JSON field helpers for stream payloads.
//!
//! The backend encodes numbers inconsistently: sometimes as JSON numbers,
//! sometimes as numeric strings (`"190.25"`). These helpers accept both.

/// Parse a JSON value (string or number) as `f64`.
///
/// Non-finite results (`"NaN"`, `"inf"`) are treated as absent.
#[inline]
pub fn parse_str_f64(v: Option<&serde_json::Value>) -> Option<f64> {
    let v = v?;
    let parsed = if let Some(s) = v.as_str() {
        fast_float2::parse(s.trim()).ok()
    } else {
        v.as_f64()
    };
    parsed.filter(|x: &f64| x.is_finite())
}

/// Parse a JSON value (string or number) as `u64`.
///
/// Fractional numbers are truncated, negative ones rejected.
#[inline]
pub fn parse_str_u64(v: Option<&serde_json::Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.trim().parse().ok()
    } else {
        v.as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0 && f.is_finite()).map(|f| f as u64))
    }
}

/// Parse the first present key among `keys` as `f64`.
#[inline]
pub fn parse_f64_field(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| parse_str_f64(v.get(*k)))
}

/// Parse the first present key among `keys` as `u64`.
#[inline]
pub fn parse_u64_field(v: &serde_json::Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| parse_str_u64(v.get(*k)))
}

/// First present key among `keys` as a non-empty string.
#[inline]
pub fn str_field<'a>(v: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(|s| s.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_and_strings() {
        assert_eq!(parse_str_f64(Some(&json!(1.5))), Some(1.5));
        assert_eq!(parse_str_f64(Some(&json!("2.25"))), Some(2.25));
        assert_eq!(parse_str_f64(Some(&json!("abc"))), None);
        assert_eq!(parse_str_f64(Some(&json!("NaN"))), None);
        assert_eq!(parse_str_f64(Some(&json!(null))), None);
        assert_eq!(parse_str_f64(None), None);
    }

    #[test]
    fn unsigned_parsing() {
        assert_eq!(parse_str_u64(Some(&json!(1700000000000u64))), Some(1_700_000_000_000));
        assert_eq!(parse_str_u64(Some(&json!("42"))), Some(42));
        assert_eq!(parse_str_u64(Some(&json!(12.9))), Some(12));
        assert_eq!(parse_str_u64(Some(&json!(-1))), None);
    }

    #[test]
    fn first_present_key_wins() {
        let v = json!({"symbol": "TSLA", "px": "3", "price": 4});
        assert_eq!(parse_f64_field(&v, &["price", "px"]), Some(4.0));
        assert_eq!(parse_f64_field(&v, &["last", "px"]), Some(3.0));
        assert_eq!(str_field(&v, &["ticker", "symbol"]), Some("TSLA"));
        assert_eq!(str_field(&json!({"ticker": " "}), &["ticker"]), None);
    }
}
