//! Narrow interfaces to the collaborators this layer consumes.
//!
//! - [`MarketDataSource`] — REST history and quote snapshots that seed state
//! - [`TokenProvider`] — opaque bearer token, resolved at every connect

use async_trait::async_trait;

use crate::{CandleBatch, MxError, Quote, Resolution};

/// Historical candles and quote snapshots, fetched on demand.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch the full historical series for `(instrument, resolution)`.
    async fn get_candles(
        &self,
        instrument: &str,
        resolution: Resolution,
    ) -> Result<CandleBatch, MxError>;

    /// Fetch the current quote snapshot for `instrument`.
    async fn get_quote(&self, instrument: &str) -> Result<Quote, MxError>;
}

/// Supplies the bearer token for a connect attempt.
///
/// Called once per attempt and never cached, so a refreshed token is picked
/// up by the next reconnect. `None` means "connect unauthenticated".
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// A fixed token (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the token from an environment variable at every call.
///
/// Empty values count as absent.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvToken {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|s| !s.is_empty())
    }
}
