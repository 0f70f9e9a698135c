//! In-memory STOMP broker used as the transport in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mx_core::MxError;
use mx_core::stomp::{Command, Frame};
use mx_core::ws::{Connector, TransportEvent, TransportSession};
use tokio::sync::{mpsc, watch};

use crate::connection::MessageHandler;

/// How the broker answers the next `CONNECT`.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Connected,
    Error(String),
    /// Never answer.
    Silent,
    /// Fail to open the transport at all.
    Refuse,
}

#[derive(Default)]
struct Stats {
    connects: AtomicUsize,
    tokens: Mutex<Vec<Option<String>>>,
}

struct BrokerSession {
    inbound: mpsc::Sender<TransportEvent>,
    subs: Mutex<Vec<(String, String)>>,
    closed: AtomicBool,
}

#[derive(Default)]
pub(crate) struct MockBroker {
    replies: Mutex<VecDeque<Reply>>,
    sessions: Mutex<Vec<Arc<BrokerSession>>>,
    stats: Arc<Stats>,
    message_seq: AtomicU64,
}

impl MockBroker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the answer for the next session. Defaults to `Connected`.
    pub(crate) fn push_reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.stats.connects.load(Ordering::SeqCst)
    }

    /// `Authorization` header of every `CONNECT` received.
    pub(crate) fn tokens(&self) -> Vec<Option<String>> {
        self.stats.tokens.lock().unwrap().clone()
    }

    /// Destinations subscribed on the live session.
    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.live()
            .map(|s| s.subs.lock().unwrap().iter().map(|(_, d)| d.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliver `body` to every subscription on `destination`.
    pub(crate) async fn publish(&self, destination: &str, body: &str) {
        let Some(session) = self.live() else { return };
        let ids: Vec<String> = session
            .subs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| d == destination)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let seq = self.message_seq.fetch_add(1, Ordering::SeqCst);
            let frame = Frame::new(Command::Message)
                .header("destination", destination)
                .header("subscription", id)
                .header("message-id", seq.to_string())
                .body(body);
            let _ = session.inbound.send(TransportEvent::Frame(frame)).await;
        }
    }

    /// Simulate the network dropping the live session.
    pub(crate) async fn drop_connection(&self, reason: &str) {
        if let Some(session) = self.live() {
            session.closed.store(true, Ordering::SeqCst);
            session.subs.lock().unwrap().clear();
            let _ = session
                .inbound
                .send(TransportEvent::Closed(reason.to_string()))
                .await;
        }
    }

    /// Send an `ERROR` frame on the live session.
    pub(crate) async fn send_error(&self, message: &str) {
        if let Some(session) = self.live() {
            let frame = Frame::new(Command::Error).header("message", message);
            let _ = session.inbound.send(TransportEvent::Frame(frame)).await;
        }
    }

    fn live(&self) -> Option<Arc<BrokerSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| !s.closed.load(Ordering::SeqCst))
            .cloned()
    }
}

#[async_trait]
impl Connector for MockBroker {
    fn host(&self) -> String {
        "mock-broker".to_string()
    }

    async fn open(&self) -> Result<TransportSession, MxError> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Connected);
        if matches!(reply, Reply::Refuse) {
            return Err(MxError::WebSocket("connection refused".to_string()));
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(BrokerSession {
            inbound: in_tx,
            subs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.sessions.lock().unwrap().push(session.clone());
        tokio::spawn(serve(session, self.stats.clone(), reply, out_rx, shutdown_rx));

        Ok(TransportSession::new(out_tx, in_rx, shutdown_tx))
    }
}

async fn serve(
    session: Arc<BrokerSession>,
    stats: Arc<Stats>,
    reply: Reply,
    mut out_rx: mpsc::Receiver<Frame>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break "closed by client",
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break "session dropped" };
                match frame.command {
                    Command::Connect => {
                        stats.connects.fetch_add(1, Ordering::SeqCst);
                        stats
                            .tokens
                            .lock()
                            .unwrap()
                            .push(frame.get("Authorization").map(String::from));
                        match &reply {
                            Reply::Connected => {
                                let ack = Frame::new(Command::Connected).header("version", "1.2");
                                let _ = session.inbound.send(TransportEvent::Frame(ack)).await;
                            }
                            Reply::Error(msg) => {
                                let err = Frame::new(Command::Error).header("message", msg.as_str());
                                let _ = session.inbound.send(TransportEvent::Frame(err)).await;
                                break "closed by server";
                            }
                            Reply::Silent | Reply::Refuse => {}
                        }
                    }
                    Command::Subscribe => {
                        let id = frame.get("id").unwrap_or_default().to_string();
                        let dest = frame.get("destination").unwrap_or_default().to_string();
                        session.subs.lock().unwrap().push((id, dest));
                    }
                    Command::Unsubscribe => {
                        let id = frame.get("id").unwrap_or_default();
                        session.subs.lock().unwrap().retain(|(i, _)| i != id);
                    }
                    _ => {}
                }
            }
        }
    };

    session.closed.store(true, Ordering::SeqCst);
    session.subs.lock().unwrap().clear();
    let _ = session
        .inbound
        .send(TransportEvent::Closed(reason.to_string()))
        .await;
}

/// Handler that records every `(topic, body)` it receives.
pub(crate) fn collecting_handler() -> (MessageHandler, Arc<Mutex<Vec<(String, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: MessageHandler = Arc::new(move |topic: &str, body: &str| {
        sink.lock().unwrap().push((topic.to_string(), body.to_string()));
    });
    (handler, seen)
}

/// Poll `cond` until it holds; panics after about a second.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met in time");
}
