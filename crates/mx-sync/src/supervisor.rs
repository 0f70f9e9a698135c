//! Reconnect supervisor.
//!
//! Watches [`ConnectionEvent`]s. On an unexpected loss it drains the
//! registry, retries `connect()` with exponential backoff and full jitter,
//! then restores every drained topic with its original handler. A topic
//! subscribed again while the supervisor was backing off keeps the newer
//! handler.
//!
//! If every retry fails the drained topics are parked; they are restored the
//! next time anything else brings the connection back. An explicit
//! `disconnect()` ends recovery and drops whatever was drained or parked.

use std::sync::Arc;
use std::time::Duration;

use mx_core::ConnectError;
use mx_core::config::ReconnectConfig;
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionEvent, ConnectionManager, MessageHandler};
use crate::registry::{Restore, SubscriptionRegistry};

type Drained = Vec<(String, MessageHandler)>;

/// How a reconnect cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Reconnected,
    Exhausted,
    /// The owner disconnected explicitly.
    Abandoned,
    Shutdown,
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            initial: Duration::from_millis(cfg.initial_backoff_ms),
            max: Duration::from_millis(cfg.max_backoff_ms),
            max_retries: cfg.max_retries,
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the delay before retry `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Random delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}

/// Running supervisor task.
pub struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop the supervisor and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct Supervisor {
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    policy: BackoffPolicy,
}

impl Supervisor {
    pub fn new(
        connection: ConnectionManager,
        registry: Arc<SubscriptionRegistry>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            connection,
            registry,
            policy,
        }
    }

    pub fn spawn(self) -> SupervisorHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        // Subscribe before spawning so no event between here and the first
        // poll is missed.
        let events = self.connection.events();
        let task = tokio::spawn(self.run(events, shutdown_rx));
        SupervisorHandle { shutdown, task }
    }

    async fn run(
        self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "[supervisor] started (backoff {:?}..{:?}, {} retries)",
            self.policy.initial, self.policy.max, self.policy.max_retries
        );
        let mut parked: Drained = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Lost { reason }) => {
                        let mut topics = self.registry.invalidate().await;
                        topics.append(&mut parked);
                        warn!(
                            "[supervisor] connection lost ({reason}), restoring {} topics",
                            topics.len()
                        );
                        match self.reconnect(&mut topics, &mut events, &mut shutdown).await {
                            Recovery::Reconnected => self.restore(topics).await,
                            Recovery::Exhausted => parked = topics,
                            Recovery::Abandoned => {
                                info!("[supervisor] disconnected explicitly, dropping {} topics", topics.len());
                            }
                            Recovery::Shutdown => break,
                        }
                    }
                    Ok(ConnectionEvent::Connected) if !parked.is_empty() => {
                        info!("[supervisor] connection back, restoring {} parked topics", parked.len());
                        self.restore(std::mem::take(&mut parked)).await;
                    }
                    Ok(ConnectionEvent::Closed) if !parked.is_empty() => {
                        info!("[supervisor] disconnected explicitly, dropping {} parked topics", parked.len());
                        parked.clear();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[supervisor] missed {n} connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("[supervisor] stopped");
    }

    /// Retry until connected.
    ///
    /// Keeps watching events while backing off: a `Closed` abandons the
    /// cycle, a further `Lost` drains the registry into `topics` again.
    async fn reconnect(
        &self,
        topics: &mut Drained,
        events: &mut broadcast::Receiver<ConnectionEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Recovery {
        for attempt in 0..self.policy.max_retries {
            let sleep = tokio::time::sleep(self.policy.delay(attempt));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return Recovery::Shutdown,
                    _ = &mut sleep => break,
                    event = events.recv() => match event {
                        Ok(ConnectionEvent::Closed) => return Recovery::Abandoned,
                        Ok(ConnectionEvent::Lost { .. }) => {
                            topics.append(&mut self.registry.invalidate().await);
                        }
                        Ok(ConnectionEvent::Connected) => {
                            debug!("[supervisor] connected elsewhere during backoff");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("[supervisor] missed {n} connection events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Recovery::Shutdown,
                    },
                }
            }

            match self.connection.connect().await {
                Ok(()) => {
                    info!("[supervisor] reconnected after {} attempts", attempt + 1);
                    return Recovery::Reconnected;
                }
                Err(ConnectError::Cancelled) => return Recovery::Abandoned,
                Err(e) => warn!(
                    "[supervisor] reconnect attempt {}/{} failed: {e}",
                    attempt + 1,
                    self.policy.max_retries
                ),
            }
        }
        error!(
            "[supervisor] giving up after {} attempts",
            self.policy.max_retries
        );
        Recovery::Exhausted
    }

    async fn restore(&self, topics: Drained) {
        let total = topics.len();
        let mut restored = 0;
        for (topic, handler) in topics {
            match self.registry.restore(&topic, handler).await {
                Restore::Restored(_) => restored += 1,
                Restore::Superseded => {}
                Restore::Failed => warn!("[supervisor] could not restore {topic}"),
            }
        }
        info!("[supervisor] restored {restored}/{total} topics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectOptions;
    use crate::testing::{MockBroker, Reply, collecting_handler, eventually};
    use mx_core::source::StaticToken;

    fn setup(broker: &Arc<MockBroker>) -> (ConnectionManager, Arc<SubscriptionRegistry>) {
        let conn = ConnectionManager::new(
            broker.clone(),
            Arc::new(StaticToken(None)),
            ConnectOptions::default(),
        );
        let registry = Arc::new(SubscriptionRegistry::new(conn.clone()));
        (conn, registry)
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_retries: 10,
        };
        assert_eq!(policy.ceiling(0), Duration::from_millis(500));
        assert_eq!(policy.ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.ceiling(3), Duration::from_secs(4));
        assert_eq!(policy.ceiling(10), Duration::from_secs(30));
        assert_eq!(policy.ceiling(40), Duration::from_secs(30));
        for attempt in 0..12 {
            assert!(policy.delay(attempt) <= policy.ceiling(attempt));
        }
    }

    #[test]
    fn default_policy_matches_config_defaults() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.initial, Duration::from_millis(500));
        assert_eq!(policy.max, Duration::from_secs(30));
        assert_eq!(policy.max_retries, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn restores_topics_after_loss() {
        let broker = MockBroker::new();
        let (conn, registry) = setup(&broker);
        let supervisor = Supervisor::new(conn.clone(), registry.clone(), BackoffPolicy::default()).spawn();

        let (h, got) = collecting_handler();
        registry.subscribe("/topic/stock/AAPL", h).await.unwrap();

        // First reconnect attempt fails, the second succeeds.
        broker.push_reply(Reply::Refuse);
        broker.drop_connection("reset by peer").await;

        eventually(|| broker.connect_count() == 2 && broker.subscriptions().len() == 1).await;
        assert!(registry.is_subscribed("/topic/stock/AAPL").await);

        broker.publish("/topic/stock/AAPL", "after").await;
        eventually(|| got.lock().unwrap().len() == 1).await;

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_then_restores_on_manual_connect() {
        let broker = MockBroker::new();
        let (conn, registry) = setup(&broker);
        let policy = BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            max_retries: 2,
        };
        let supervisor = Supervisor::new(conn.clone(), registry.clone(), policy).spawn();

        let (h, _) = collecting_handler();
        registry.subscribe("/topic/index", h).await.unwrap();

        broker.push_reply(Reply::Refuse);
        broker.push_reply(Reply::Refuse);
        broker.drop_connection("gone").await;

        // Both retries fail; the topic is parked.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!conn.is_connected());
        assert!(registry.is_empty().await);
        assert!(!supervisor.is_finished());

        conn.connect().await.unwrap();
        eventually(|| broker.subscriptions() == vec!["/topic/index".to_string()]).await;

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_is_not_recovered() {
        let broker = MockBroker::new();
        let (conn, registry) = setup(&broker);
        let supervisor = Supervisor::new(conn.clone(), registry.clone(), BackoffPolicy::default()).spawn();

        let (h, _) = collecting_handler();
        registry.subscribe("/topic/index", h).await.unwrap();
        conn.disconnect().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.connect_count(), 1);
        assert!(!conn.is_connected());

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_backoff_ends_recovery() {
        let broker = MockBroker::new();
        let (conn, registry) = setup(&broker);
        let supervisor = Supervisor::new(conn.clone(), registry.clone(), BackoffPolicy::default()).spawn();

        let (h, got) = collecting_handler();
        registry.subscribe("/topic/stock/AAPL", h).await.unwrap();

        broker.push_reply(Reply::Refuse);
        broker.push_reply(Reply::Refuse);
        broker.drop_connection("reset by peer").await;
        eventually(|| !conn.is_connected()).await;

        registry.clear().await;
        conn.disconnect().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.connect_count(), 1);
        assert!(!conn.is_connected());
        assert!(broker.subscriptions().is_empty());

        // A later connect does not bring the dropped topic back.
        conn.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.is_empty().await);
        broker.publish("/topic/stock/AAPL", "x").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(got.lock().unwrap().is_empty());
        assert!(!supervisor.is_finished());

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn newer_handler_survives_restore() {
        let broker = MockBroker::new();
        let (conn, registry) = setup(&broker);
        let policy = BackoffPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(30),
            max_retries: 10,
        };
        let supervisor = Supervisor::new(conn.clone(), registry.clone(), policy).spawn();

        let (old, got_old) = collecting_handler();
        let (new, got_new) = collecting_handler();
        registry.subscribe("/topic/stock/AAPL", old).await.unwrap();

        broker.drop_connection("reset by peer").await;
        eventually(|| !conn.is_connected()).await;
        registry.subscribe("/topic/stock/AAPL", new).await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.topics().await, vec!["/topic/stock/AAPL".to_string()]);
        assert_eq!(broker.subscriptions(), vec!["/topic/stock/AAPL".to_string()]);

        broker.publish("/topic/stock/AAPL", "x").await;
        eventually(|| got_new.lock().unwrap().len() == 1).await;
        assert!(got_old.lock().unwrap().is_empty());

        supervisor.stop().await;
    }
}
