//! Typed error definitions for the mx synchronization layer.
//!
//! [`MxError`] covers general failures (config, transport, parsing, HTTP).
//! [`ConnectError`] is the outcome of a failed connect attempt; it is `Clone`
//! because every caller waiting on the same attempt receives the same value.

use std::time::Duration;

use thiserror::Error;

/// Domain-specific errors for the mx system.
#[derive(Debug, Error)]
pub enum MxError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// STOMP frame could not be decoded or was not expected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload parsing error.
    #[error("parse error: {0}")]
    Parse(String),

    /// REST collaborator error (request, status, or body).
    #[error("http error: {0}")]
    Http(String),

    /// The operation needs an acknowledged connection.
    #[error("not connected")]
    NotConnected,

    /// A connect attempt failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Why a connect attempt did not reach the acknowledged state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// No `CONNECTED` frame arrived within the connect timeout.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The broker answered with an `ERROR` frame.
    #[error("broker reported error: {0}")]
    Protocol(String),

    /// The transport could not be opened.
    #[error("transport failed: {0}")]
    Transport(String),

    /// The transport closed before the attempt was acknowledged.
    #[error("connection closed: {0}")]
    Disconnected(String),

    /// `disconnect()` was called while the attempt was in flight.
    #[error("connect cancelled")]
    Cancelled,
}
