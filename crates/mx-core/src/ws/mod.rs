//! WebSocket transport carrying STOMP frames.
//!
//! The connection manager never touches sockets directly: it asks a
//! [`Connector`] for a fresh [`TransportSession`] per connect attempt. The
//! production connector is [`WsConnector`]; tests plug in an in-memory one.

pub mod client;

pub use client::{Connector, TransportEvent, TransportSession, WsConnConfig, WsConnector};
