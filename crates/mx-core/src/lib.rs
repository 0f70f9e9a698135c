//! # mx-core
//!
//! Core crate for the mx market-data synchronization layer, providing:
//!
//! - **Types** (`types`) — quotes, trade ticks, candles, resolutions, topic naming
//! - **Configuration** (`config`) — JSON config deserialization
//! - **Error types** (`error`) — `MxError` and the cloneable `ConnectError`
//! - **STOMP codec** (`stomp`) — frame encoding/decoding over WebSocket text
//! - **WebSocket** (`ws`) — transport sessions behind the `Connector` trait
//! - **Collaborators** (`source`) — historical/quote source and token provider traits
//! - **Time utilities** (`time_util`) — wall-clock timestamps
//! - **Logging** (`logging`) — tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod source;
pub mod stomp;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use error::{ConnectError, MxError};
pub use types::*;
