//! # mx-rest
//!
//! HTTP implementation of [`MarketDataSource`] against the trading backend.
//!
//! | data | endpoint |
//! |------|----------|
//! | candles | `GET {base}/api/v1/stock/candles/{ticker}?timeframe={d\|w\|m}` |
//! | quote   | `GET {base}/api/v1/stock/quote/{ticker}` |
//!
//! Bodies may be bare or wrapped in a `{"success": bool, "data": ...}`
//! envelope. A candle body is either `{"items": [...]}` or a bare array.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mx_core::config::RestConfig;
use mx_core::source::{MarketDataSource, TokenProvider};
use mx_core::{Candle, CandleBatch, MxError, Quote, Resolution};
use tracing::debug;

pub struct HttpMarketSource {
    http: reqwest::Client,
    base_url: String,
    token: Arc<dyn TokenProvider>,
}

impl HttpMarketSource {
    /// Build a client with the configured request timeout.
    ///
    /// # Errors
    ///
    /// [`MxError::Http`] if the underlying client cannot be built.
    pub fn new(config: &RestConfig, token: Arc<dyn TokenProvider>) -> Result<Self, MxError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| MxError::Http(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn candles_url(&self, ticker: &str, resolution: Resolution) -> String {
        format!(
            "{}/api/v1/stock/candles/{}?timeframe={}",
            self.base_url,
            urlencoding::encode(ticker),
            resolution.as_str()
        )
    }

    fn quote_url(&self, ticker: &str) -> String {
        format!(
            "{}/api/v1/stock/quote/{}",
            self.base_url,
            urlencoding::encode(ticker)
        )
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, MxError> {
        let mut request = self.http.get(url);
        if let Some(token) = self.token.token() {
            request = request.bearer_auth(token);
        }

        let body: serde_json::Value = request
            .send()
            .await
            .map_err(|e| MxError::Http(format!("GET {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| MxError::Http(format!("GET {url}: {e}")))?
            .json()
            .await
            .map_err(|e| MxError::Http(format!("GET {url}: invalid body: {e}")))?;

        debug!("[rest] GET {url} ok");
        unwrap_envelope(body)
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketSource {
    async fn get_candles(
        &self,
        instrument: &str,
        resolution: Resolution,
    ) -> Result<CandleBatch, MxError> {
        let body = self.get_json(&self.candles_url(instrument, resolution)).await?;
        parse_candle_batch(body, instrument, resolution)
    }

    async fn get_quote(&self, instrument: &str) -> Result<Quote, MxError> {
        let body = self.get_json(&self.quote_url(instrument)).await?;
        parse_quote(body, instrument)
    }
}

// ---------------------------------------------------------------------------
// Body parsing
// ---------------------------------------------------------------------------

/// Strip a `{"success", "data"}` envelope. `success: false` is an error
/// carrying the envelope's `message`.
pub fn unwrap_envelope(body: serde_json::Value) -> Result<serde_json::Value, MxError> {
    let Some(success) = body.get("success").and_then(|s| s.as_bool()) else {
        return Ok(body);
    };
    if !success {
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("request rejected");
        return Err(MxError::Http(message.to_string()));
    }
    Ok(body.get("data").cloned().unwrap_or(serde_json::Value::Null))
}

/// Parse a candle body, defaulting ticker and resolution to the request.
pub fn parse_candle_batch(
    body: serde_json::Value,
    ticker: &str,
    resolution: Resolution,
) -> Result<CandleBatch, MxError> {
    let items = match body {
        serde_json::Value::Array(_) => body,
        serde_json::Value::Object(mut map) => map
            .remove("items")
            .or_else(|| map.remove("candles"))
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new())),
        serde_json::Value::Null => serde_json::Value::Array(Vec::new()),
        other => {
            return Err(MxError::Parse(format!("unexpected candle body: {other}")));
        }
    };

    let items: Vec<Candle> = serde_json::from_value(items)
        .map_err(|e| MxError::Parse(format!("candles for {ticker}: {e}")))?;

    Ok(CandleBatch {
        ticker: ticker.to_string(),
        resolution,
        items,
    })
}

/// Parse a quote body, defaulting the ticker to the request.
pub fn parse_quote(body: serde_json::Value, ticker: &str) -> Result<Quote, MxError> {
    let mut quote: Quote = serde_json::from_value(body)
        .map_err(|e| MxError::Parse(format!("quote for {ticker}: {e}")))?;
    if quote.ticker.trim().is_empty() {
        quote.ticker = ticker.to_string();
    }
    Ok(quote)
}
