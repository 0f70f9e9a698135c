//! # mx-sync
//!
//! Real-time market-data synchronization over one STOMP connection.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionManager ─► SubscriptionRegistry ─► classifier ─┬─► quote merger
//!        ▲                                                   └─► aggregator ─► series
//!        └── Supervisor (reconnect + re-subscribe)
//! ```
//!
//! [`MarketSync`] owns all of it; share it through `Arc`.
//!
//! ## Modules
//!
//! - [`connection`] — session lifecycle, shared connect outcome, routing
//! - [`registry`] — topic → subscription, one per topic
//! - [`classifier`] — payload → `Classified::{Quote, Trade, Malformed}`
//! - [`quote`] — partial-field quote merging
//! - [`aggregator`] — rolling tick window bucketed into candles
//! - [`series`] — ordered candle series with load/upsert/fallback
//! - [`book`] — per-instrument state behind one lock
//! - [`supervisor`] — reconnect with backoff and jitter
//! - [`service`] — the [`MarketSync`] facade

pub mod aggregator;
pub mod book;
pub mod classifier;
pub mod connection;
pub mod json_util;
pub mod quote;
pub mod registry;
pub mod series;
pub mod service;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use classifier::{Classified, classify};
pub use connection::{
    ConnectOptions, ConnectionEvent, ConnectionManager, MessageHandler, SubscriptionHandle,
};
pub use registry::{Restore, SubscriptionRegistry};
pub use series::CandleSeries;
pub use service::{MarketSync, SyncOptions};
pub use supervisor::{BackoffPolicy, SupervisorHandle};
