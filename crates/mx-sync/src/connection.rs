//! Connection manager: the single STOMP session shared by every logical
//! subscription.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──CONNECTED──► Connected
//!      ▲                          │                          │
//!      └──── timeout / ERROR ─────┘◄── close / ERROR / disconnect()
//! ```
//!
//! Concurrent `connect()` callers join the attempt in flight through a shared
//! `watch` channel, so they all observe the same outcome. The manager never
//! retries on its own; reconnection belongs to the supervisor, which listens
//! on [`ConnectionManager::events`].
//!
//! Every attempt and every explicit disconnect bumps a generation counter.
//! Work tagged with an older generation (a late handshake, a reader task for
//! a torn-down session, a stale subscription handle) is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use mx_core::config::StreamConfig;
use mx_core::stomp::{Command, Frame};
use mx_core::source::TokenProvider;
use mx_core::ws::{Connector, TransportEvent, TransportSession};
use mx_core::{ConnectError, ConnectionState, MxError};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Callback invoked with `(topic, body)` for every message on a subscription.
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// `None` while an attempt is in flight.
type Outcome = Option<Result<(), ConnectError>>;

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker acknowledged a connect attempt.
    Connected,
    /// The session ended without `disconnect()` being called.
    Lost { reason: String },
    /// `disconnect()` tore the session down.
    Closed,
}

/// One live subscription on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: String,
    topic: String,
    generation: u64,
}

impl SubscriptionHandle {
    /// Per-connection subscription id (`sub-N`).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Connect-time settings.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Heart-beat interval advertised in `CONNECT`, in milliseconds.
    pub heartbeat_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_ms: 10_000,
        }
    }
}

impl From<&StreamConfig> for ConnectOptions {
    fn from(cfg: &StreamConfig) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout(),
            heartbeat_ms: cfg.heartbeat_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ActiveSession {
    outbound: mpsc::Sender<Frame>,
    shutdown: watch::Sender<bool>,
}

impl ActiveSession {
    fn close(self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Default)]
struct Inner {
    pending: Option<watch::Sender<Outcome>>,
    session: Option<ActiveSession>,
    /// Set by `connect()`, cleared by `disconnect()`. Survives a loss.
    open: bool,
}

struct Route {
    topic: String,
    handler: MessageHandler,
}

struct Shared {
    connector: Arc<dyn Connector>,
    token: Arc<dyn TokenProvider>,
    options: ConnectOptions,
    /// Lock order: `inner` before `routes`.
    inner: Mutex<Inner>,
    routes: Mutex<AHashMap<String, Route>>,
    /// Only written while `inner` is held.
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    next_sub_id: AtomicU64,
}

/// Owns the one streaming connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        token: Arc<dyn TokenProvider>,
        options: ConnectOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                connector,
                token,
                options,
                inner: Mutex::new(Inner::default()),
                routes: Mutex::new(AHashMap::new()),
                generation: AtomicU64::new(0),
                state,
                events,
                next_sub_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// True only once the broker has acknowledged the session.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Whether `handle` belongs to the current, acknowledged connection.
    pub fn is_live(&self, handle: &SubscriptionHandle) -> bool {
        self.is_connected() && handle.generation == self.shared.generation.load(Ordering::Acquire)
    }

    /// Establish the session, or join the attempt already in flight.
    ///
    /// Resolves immediately when already connected. The bearer token is read
    /// from the [`TokenProvider`] at the start of every new attempt.
    ///
    /// # Errors
    ///
    /// [`ConnectError::Timeout`] when no `CONNECTED` arrives in time,
    /// [`ConnectError::Protocol`] on a broker `ERROR`,
    /// [`ConnectError::Transport`]/[`ConnectError::Disconnected`] when the
    /// transport fails, [`ConnectError::Cancelled`] when `disconnect()` wins.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut rx = {
            let mut inner = self.shared.inner.lock().await;
            if self.is_connected() {
                return Ok(());
            }
            match inner.pending.as_ref().map(watch::Sender::subscribe) {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = watch::channel(None);
                    inner.pending = Some(tx);
                    inner.open = true;
                    let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    self.shared.state.send_replace(ConnectionState::Connecting);
                    tokio::spawn(run_attempt(Arc::clone(&self.shared), generation));
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ConnectError::Cancelled))
    }

    /// Tear the session down. Idempotent.
    ///
    /// A pending `connect()` resolves to [`ConnectError::Cancelled`]; every
    /// subscription on the connection ends. [`ConnectionEvent::Closed`] is
    /// emitted once per `connect()`, even when the connection was already
    /// lost.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        if !inner.open && inner.pending.is_none() && inner.session.is_none() {
            return;
        }
        inner.open = false;
        let pending = inner.pending.take();
        let session = inner.session.take();

        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(tx) = pending {
            let _ = tx.send(Some(Err(ConnectError::Cancelled)));
        }
        if let Some(session) = session {
            session.close();
        }
        self.shared.routes.lock().await.clear();
        self.shared.state.send_replace(ConnectionState::Disconnected);
        drop(inner);

        info!("[conn] disconnected");
        let _ = self.shared.events.send(ConnectionEvent::Closed);
    }

    /// Register `handler` for `topic` on the current connection.
    ///
    /// The route is installed before `SUBSCRIBE` is sent, so no early
    /// `MESSAGE` is lost.
    ///
    /// # Errors
    ///
    /// [`MxError::NotConnected`] without an acknowledged session.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle, MxError> {
        let inner = self.shared.inner.lock().await;
        let session = match &inner.session {
            Some(s) if self.is_connected() => s,
            _ => return Err(MxError::NotConnected),
        };

        let id = format!("sub-{}", self.shared.next_sub_id.fetch_add(1, Ordering::Relaxed));
        self.shared.routes.lock().await.insert(
            id.clone(),
            Route {
                topic: topic.to_string(),
                handler,
            },
        );

        if session.outbound.send(Frame::subscribe(&id, topic)).await.is_err() {
            self.shared.routes.lock().await.remove(&id);
            return Err(MxError::NotConnected);
        }

        debug!("[conn] subscribed {id} -> {topic}");
        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
            generation: self.shared.generation.load(Ordering::Acquire),
        })
    }

    /// Cancel a subscription. Handles from a previous connection only drop
    /// their local route.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let inner = self.shared.inner.lock().await;
        self.shared.routes.lock().await.remove(&handle.id);

        if handle.generation != self.shared.generation.load(Ordering::Acquire) {
            return;
        }
        if let Some(session) = &inner.session {
            let _ = session.outbound.send(Frame::unsubscribe(&handle.id)).await;
            debug!("[conn] unsubscribed {} ({})", handle.id, handle.topic);
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Drive one connect attempt to an outcome and publish it.
async fn run_attempt(shared: Arc<Shared>, generation: u64) {
    let timeout = shared.options.connect_timeout;
    let result = match tokio::time::timeout(timeout, handshake(&shared)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(timeout)),
    };

    let mut inner = shared.inner.lock().await;
    if shared.generation.load(Ordering::Acquire) != generation {
        // disconnect() already resolved this attempt.
        if let Ok(session) = result {
            let _ = session.shutdown.send(true);
        }
        return;
    }

    let outcome = match result {
        Ok(session) => {
            let TransportSession {
                outbound,
                inbound,
                shutdown,
            } = session;
            inner.session = Some(ActiveSession { outbound, shutdown });
            shared.state.send_replace(ConnectionState::Connected);
            tokio::spawn(read_loop(Arc::clone(&shared), generation, inbound));
            info!("[conn] connected to {}", shared.connector.host());
            let _ = shared.events.send(ConnectionEvent::Connected);
            Ok(())
        }
        Err(e) => {
            error!("[conn] connect failed: {e}");
            shared.state.send_replace(ConnectionState::Disconnected);
            Err(e)
        }
    };

    if let Some(tx) = inner.pending.take() {
        let _ = tx.send(Some(outcome));
    }
}

/// Open a transport, send `CONNECT`, wait for `CONNECTED`.
async fn handshake(shared: &Shared) -> Result<TransportSession, ConnectError> {
    let token = shared.token.token();
    let mut session = shared
        .connector
        .open()
        .await
        .map_err(|e| ConnectError::Transport(e.to_string()))?;

    let connect = Frame::connect(
        &shared.connector.host(),
        shared.options.heartbeat_ms,
        token.as_deref(),
    );
    if session.outbound.send(connect).await.is_err() {
        return Err(ConnectError::Disconnected(
            "transport closed before CONNECT".to_string(),
        ));
    }

    loop {
        match session.inbound.recv().await {
            Some(TransportEvent::Frame(frame)) => match frame.command {
                Command::Connected => return Ok(session),
                Command::Error => return Err(ConnectError::Protocol(error_text(&frame))),
                other => debug!("[conn] ignoring {} before CONNECTED", other.as_str()),
            },
            Some(TransportEvent::Closed(reason)) => return Err(ConnectError::Disconnected(reason)),
            None => {
                return Err(ConnectError::Disconnected("transport ended".to_string()));
            }
        }
    }
}

/// Route inbound frames until the session ends, then report the loss.
async fn read_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut inbound: mpsc::Receiver<TransportEvent>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(TransportEvent::Frame(frame)) => match frame.command {
                Command::Message => dispatch(&shared, &frame).await,
                Command::Error => break format!("broker error: {}", error_text(&frame)),
                Command::Receipt | Command::Connected => {}
                other => debug!("[conn] unexpected {} frame", other.as_str()),
            },
            Some(TransportEvent::Closed(reason)) => break reason,
            None => break "transport ended".to_string(),
        }
    };

    let mut inner = shared.inner.lock().await;
    if shared.generation.load(Ordering::Acquire) != generation {
        return;
    }
    if let Some(session) = inner.session.take() {
        session.close();
    }
    shared.routes.lock().await.clear();
    shared.state.send_replace(ConnectionState::Disconnected);
    drop(inner);

    warn!("[conn] connection lost: {reason}");
    let _ = shared.events.send(ConnectionEvent::Lost { reason });
}

/// Hand a `MESSAGE` body to its route. The handler runs outside the lock.
async fn dispatch(shared: &Shared, frame: &Frame) {
    let route = {
        let routes = shared.routes.lock().await;
        frame
            .get("subscription")
            .and_then(|id| routes.get(id))
            .or_else(|| {
                let dest = frame.get("destination")?;
                routes.values().find(|r| r.topic == dest)
            })
            .map(|r| (r.topic.clone(), Arc::clone(&r.handler)))
    };

    match route {
        Some((topic, handler)) => handler(&topic, &frame.body),
        None => debug!(
            "[conn] no route for message on {}",
            frame.get("destination").unwrap_or("?")
        ),
    }
}

fn error_text(frame: &Frame) -> String {
    match frame.get("message") {
        Some(msg) if !frame.body.is_empty() => format!("{msg}: {}", frame.body),
        Some(msg) => msg.to_string(),
        None => frame.body.clone(),
    }
}
