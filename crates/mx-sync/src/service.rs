//! [`MarketSync`]: the owned synchronization service.
//!
//! One instance holds the connection, the subscription registry and every
//! instrument's quote, tick window and candle series. Callers share it
//! through `Arc` and read state through accessors that return copies.
//!
//! ```text
//! ConnectionManager ─► SubscriptionRegistry ─► classify() ─┬─► quote merger ─┐
//!                                                           └─► aggregator ───┴─► series
//! ```
//!
//! Stream handlers capture only the shared state, never the service itself,
//! so the registry never keeps the service alive.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use ahash::AHashMap;
use mx_core::config::AggregationConfig;
use mx_core::source::MarketDataSource;
use mx_core::{
    Candle, ConnectError, FeedState, INDEX_TOPIC, LastPrice, MxError, Quote, QuoteUpdate,
    Resolution, TradeTick, instrument_topic, time_util,
};
use tracing::{debug, info, warn};

use crate::book::{BookUpdate, InstrumentBook};
use crate::classifier::{Classified, QuoteMessage, TradeMessage, classify};
use crate::connection::{ConnectionManager, MessageHandler, SubscriptionHandle};
use crate::registry::SubscriptionRegistry;
use crate::supervisor::{BackoffPolicy, Supervisor, SupervisorHandle};

/// Aggregation settings.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Rolling tick window per instrument.
    pub window: Duration,
    /// Quote-driven fallback starts a new candle past this move, in percent.
    pub divergence_pct: f64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&AggregationConfig::default())
    }
}

impl From<&AggregationConfig> for SyncOptions {
    fn from(cfg: &AggregationConfig) -> Self {
        Self {
            window: Duration::from_secs(cfg.window_secs),
            divergence_pct: cfg.divergence_pct,
        }
    }
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Quote and series state for every instrument.
///
/// Lock order: an instrument's book, then `last_prices`. `books` is only
/// held long enough to look an entry up.
struct SyncState {
    options: SyncOptions,
    books: RwLock<AHashMap<String, Arc<Mutex<InstrumentBook>>>>,
    last_prices: RwLock<AHashMap<String, LastPrice>>,
}

impl SyncState {
    fn new(options: SyncOptions) -> Self {
        Self {
            options,
            books: RwLock::new(AHashMap::new()),
            last_prices: RwLock::new(AHashMap::new()),
        }
    }

    fn book(&self, symbol: &str) -> Arc<Mutex<InstrumentBook>> {
        if let Some(book) = read(&self.books).get(symbol) {
            return Arc::clone(book);
        }
        let mut books = write(&self.books);
        let book = books.entry(symbol.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(InstrumentBook::new(symbol, self.options.window)))
        });
        Arc::clone(book)
    }

    fn existing_book(&self, symbol: &str) -> Option<Arc<Mutex<InstrumentBook>>> {
        read(&self.books).get(symbol).cloned()
    }

    fn handle_message(&self, topic: &str, body: &str) {
        let now_ms = time_util::now_ms();
        match classify(topic, body) {
            Classified::Quote(QuoteMessage { instrument, update }) => {
                self.apply_quote(topic, &instrument, &update, now_ms);
            }
            Classified::Trade(TradeMessage { instrument, tick }) => {
                self.apply_trade(topic, &instrument, tick, now_ms);
            }
            Classified::Malformed(reason) => {
                warn!("[sync] dropped payload on {topic}: {reason}");
            }
        }
    }

    fn apply_quote(&self, topic: &str, symbol: &str, update: &QuoteUpdate, now_ms: u64) -> BookUpdate {
        let book = self.book(symbol);
        let mut book = lock(&book);
        book.record_topic(topic);
        let result = book.apply_quote(update, now_ms, self.options.divergence_pct);
        self.publish_last_price(book.quote());
        result
    }

    fn apply_trade(&self, topic: &str, symbol: &str, tick: TradeTick, now_ms: u64) -> BookUpdate {
        let book = self.book(symbol);
        let mut book = lock(&book);
        book.record_topic(topic);
        let result = book.apply_trade(tick, now_ms);
        if result.quote_changed {
            self.publish_last_price(book.quote());
        }
        for (resolution, candle) in &result.candles {
            debug!("[sync] {symbol}/{resolution} {candle}");
        }
        result
    }

    /// Caller holds the instrument's book lock.
    fn publish_last_price(&self, quote: &Quote) {
        write(&self.last_prices).insert(quote.ticker.clone(), LastPrice::from(quote));
    }
}

// ---------------------------------------------------------------------------
// MarketSync
// ---------------------------------------------------------------------------

pub struct MarketSync {
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    state: Arc<SyncState>,
    source: Option<Arc<dyn MarketDataSource>>,
}

impl MarketSync {
    pub fn new(connection: ConnectionManager, options: SyncOptions) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(connection.clone()));
        Self {
            connection,
            registry,
            state: Arc::new(SyncState::new(options)),
            source: None,
        }
    }

    /// Attach the REST collaborator used by [`Self::load_history`] and
    /// [`Self::refresh_quote`].
    pub fn with_source(mut self, source: Arc<dyn MarketDataSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect().await
    }

    /// Cancel every subscription and close the connection.
    pub async fn disconnect(&self) {
        self.registry.clear().await;
        self.connection.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Start the reconnect supervisor for this service's connection.
    pub fn spawn_supervisor(&self, policy: BackoffPolicy) -> SupervisorHandle {
        Supervisor::new(self.connection.clone(), Arc::clone(&self.registry), policy).spawn()
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe an arbitrary handler to `topic`.
    pub async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Option<SubscriptionHandle> {
        self.registry.subscribe(topic, handler).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> bool {
        self.registry.unsubscribe(topic).await
    }

    /// Stream quotes and trades for `symbol` into this service's state.
    pub async fn watch_instrument(&self, symbol: &str) -> Option<SubscriptionHandle> {
        let topic = instrument_topic(symbol);
        self.registry.subscribe(&topic, self.stream_handler()).await
    }

    /// Stream the global index broadcast into this service's state.
    pub async fn watch_index(&self) -> Option<SubscriptionHandle> {
        self.registry.subscribe(INDEX_TOPIC, self.stream_handler()).await
    }

    pub async fn unwatch_instrument(&self, symbol: &str) -> bool {
        self.registry.unsubscribe(&instrument_topic(symbol)).await
    }

    fn stream_handler(&self) -> MessageHandler {
        let state = Arc::clone(&self.state);
        Arc::new(move |topic: &str, body: &str| state.handle_message(topic, body))
    }

    /// Feed one raw payload through the classifier, as if received on `topic`.
    pub fn handle_message(&self, topic: &str, body: &str) {
        self.state.handle_message(topic, body);
    }

    // -----------------------------------------------------------------------
    // Chart focus and history
    // -----------------------------------------------------------------------

    /// Aggregate `symbol`'s trades at `resolution` from now on.
    ///
    /// Every bucket already in the tick window is rebuilt at the new width
    /// and upserted. Returns the number of candles upserted.
    pub fn focus_chart(&self, symbol: &str, resolution: Resolution) -> usize {
        let symbol = normalize_symbol(symbol);
        let book = self.state.book(&symbol);
        let Some(rebuilt) = lock(&book).set_focus(resolution, time_util::now_ms()) else {
            return 0;
        };
        info!(
            "[sync] chart focus {symbol}/{resolution}, re-aggregated {} buckets",
            rebuilt.len()
        );
        rebuilt.len()
    }

    /// Stop aggregating `symbol`'s trades; they update its quote again.
    pub fn unfocus_chart(&self, symbol: &str) {
        if let Some(book) = self.state.existing_book(&normalize_symbol(symbol)) {
            lock(&book).clear_focus();
        }
    }

    pub fn chart_focus(&self, symbol: &str) -> Option<Resolution> {
        let book = self.state.existing_book(&normalize_symbol(symbol))?;
        lock(&book).focus()
    }

    /// Replace `symbol`'s series at `resolution`. Returns the resulting length.
    pub fn load_series(&self, symbol: &str, resolution: Resolution, candles: Vec<Candle>) -> usize {
        let book = self.state.book(&normalize_symbol(symbol));
        lock(&book).load_series(resolution, candles, time_util::now_ms())
    }

    pub fn upsert_candle(&self, symbol: &str, resolution: Resolution, candle: Candle) -> bool {
        let book = self.state.book(&normalize_symbol(symbol));
        lock(&book).upsert_candle(resolution, candle)
    }

    /// Fetch and load the historical series for `(symbol, resolution)`.
    ///
    /// # Errors
    ///
    /// [`MxError::Config`] without a source, otherwise whatever the source
    /// returns.
    pub async fn load_history(&self, symbol: &str, resolution: Resolution) -> Result<usize, MxError> {
        let source = self.require_source()?;
        let symbol = normalize_symbol(symbol);
        let batch = source.get_candles(&symbol, resolution).await?;
        if batch.resolution != resolution {
            warn!(
                "[sync] asked for {symbol}/{resolution}, source returned {}",
                batch.resolution
            );
        }
        let fetched = batch.items.len();
        let len = self.load_series(&symbol, resolution, batch.items);
        info!("[sync] loaded {symbol}/{resolution}: {fetched} candles fetched, {len} kept");
        Ok(len)
    }

    /// Install a REST quote snapshot as `quote.ticker`'s base record.
    pub fn seed_quote(&self, quote: &Quote) {
        let symbol = normalize_symbol(&quote.ticker);
        if symbol.is_empty() {
            warn!("[sync] ignoring quote snapshot without ticker");
            return;
        }
        let book = self.state.book(&symbol);
        let mut book = lock(&book);
        book.seed_quote(quote);
        self.state.publish_last_price(book.quote());
    }

    /// Fetch a quote snapshot from the source and seed it. Returns the merged
    /// quote.
    pub async fn refresh_quote(&self, symbol: &str) -> Result<Quote, MxError> {
        let source = self.require_source()?;
        let symbol = normalize_symbol(symbol);
        let mut snapshot = source.get_quote(&symbol).await?;
        if snapshot.ticker.trim().is_empty() {
            snapshot.ticker = symbol.clone();
        }
        self.seed_quote(&snapshot);
        Ok(self.quote(&symbol).unwrap_or(snapshot))
    }

    fn require_source(&self) -> Result<&Arc<dyn MarketDataSource>, MxError> {
        self.source
            .as_ref()
            .ok_or_else(|| MxError::Config("no market data source configured".to_string()))
    }

    // -----------------------------------------------------------------------
    // Read accessors
    // -----------------------------------------------------------------------

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        let book = self.state.existing_book(&normalize_symbol(symbol))?;
        Some(lock(&book).quote().clone())
    }

    /// Last-price projections, sorted by ticker.
    pub fn last_prices(&self) -> Vec<LastPrice> {
        let mut prices: Vec<LastPrice> = read(&self.state.last_prices).values().cloned().collect();
        prices.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        prices
    }

    pub fn last_price(&self, symbol: &str) -> Option<LastPrice> {
        read(&self.state.last_prices).get(&normalize_symbol(symbol)).cloned()
    }

    /// Time-ascending candles for `(symbol, resolution)`; empty when unknown.
    pub fn series(&self, symbol: &str, resolution: Resolution) -> Vec<Candle> {
        let Some(book) = self.state.existing_book(&normalize_symbol(symbol)) else {
            return Vec::new();
        };
        lock(&book)
            .series(resolution)
            .map(|s| s.candles().to_vec())
            .unwrap_or_default()
    }

    /// Instruments with any state, sorted.
    pub fn instruments(&self) -> Vec<String> {
        let mut symbols: Vec<String> = read(&self.state.books).keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// `Live` while connected with a topic that feeds `symbol` subscribed on
    /// the current connection, `Stale` otherwise.
    ///
    /// The instrument's own topic always counts. The index broadcast counts
    /// once it has delivered data for `symbol`.
    pub async fn feed_state(&self, symbol: &str) -> FeedState {
        if !self.is_connected() {
            return FeedState::Stale;
        }
        if self.registry.is_subscribed(&instrument_topic(symbol)).await {
            return FeedState::Live;
        }
        let via_index = self
            .state
            .existing_book(&normalize_symbol(symbol))
            .is_some_and(|book| lock(&book).fed_by(INDEX_TOPIC));
        if via_index && self.registry.is_subscribed(INDEX_TOPIC).await {
            FeedState::Live
        } else {
            FeedState::Stale
        }
    }
}
