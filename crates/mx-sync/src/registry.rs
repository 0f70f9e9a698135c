//! Subscription registry: topic → live subscription on the shared connection.
//!
//! The registry is the single source of truth for what should be
//! subscribed. At most one subscription exists per topic; subscribing a topic
//! again replaces the previous handler. After a connection loss the
//! supervisor drains it with [`SubscriptionRegistry::invalidate`] and
//! restores each drained topic that nobody subscribed again meanwhile.

use std::sync::Arc;

use ahash::AHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, MessageHandler, SubscriptionHandle};

/// Outcome of [`SubscriptionRegistry::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restore {
    Restored(SubscriptionHandle),
    /// The topic was subscribed again meanwhile; that handler stays.
    Superseded,
    Failed,
}

struct Entry {
    handle: SubscriptionHandle,
    handler: MessageHandler,
}

pub struct SubscriptionRegistry {
    connection: ConnectionManager,
    entries: Mutex<AHashMap<String, Entry>>,
}

impl SubscriptionRegistry {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            entries: Mutex::new(AHashMap::new()),
        }
    }

    /// Subscribe `handler` to `topic`, connecting first when needed.
    ///
    /// Returns `None` when the connection cannot be established or the
    /// broker rejects the subscription. An existing subscription on `topic`
    /// is cancelled first, so only the newest handler receives messages.
    pub async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Option<SubscriptionHandle> {
        if let Err(e) = self.connection.connect().await {
            warn!("[registry] cannot subscribe {topic}: {e}");
            return None;
        }

        let mut entries = self.entries.lock().await;
        if let Some(old) = entries.remove(topic) {
            debug!("[registry] replacing subscription {} on {topic}", old.handle.id());
            self.connection.unsubscribe(&old.handle).await;
        }

        match self.connection.subscribe(topic, Arc::clone(&handler)).await {
            Ok(handle) => {
                info!("[registry] subscribed {topic} ({})", handle.id());
                entries.insert(
                    topic.to_string(),
                    Entry {
                        handle: handle.clone(),
                        handler,
                    },
                );
                Some(handle)
            }
            Err(e) => {
                warn!("[registry] subscribe {topic} failed: {e}");
                None
            }
        }
    }

    /// Re-subscribe a drained `handler` to `topic` on the current connection,
    /// unless `topic` already has a subscription. Never connects.
    pub async fn restore(&self, topic: &str, handler: MessageHandler) -> Restore {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(topic) {
            debug!("[registry] {topic} already resubscribed, dropping stale handler");
            return Restore::Superseded;
        }
        match self.connection.subscribe(topic, Arc::clone(&handler)).await {
            Ok(handle) => {
                info!("[registry] restored {topic} ({})", handle.id());
                entries.insert(
                    topic.to_string(),
                    Entry {
                        handle: handle.clone(),
                        handler,
                    },
                );
                Restore::Restored(handle)
            }
            Err(e) => {
                warn!("[registry] restore {topic} failed: {e}");
                Restore::Failed
            }
        }
    }

    /// Cancel the subscription on `topic`. Returns whether one existed.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let Some(entry) = self.entries.lock().await.remove(topic) else {
            return false;
        };
        self.connection.unsubscribe(&entry.handle).await;
        info!("[registry] unsubscribed {topic}");
        true
    }

    /// Subscribed topics, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Whether `topic` has a subscription on the current connection.
    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(topic)
            .is_some_and(|e| self.connection.is_live(&e.handle))
    }

    /// Drain every entry, returning what is needed to re-subscribe.
    pub async fn invalidate(&self) -> Vec<(String, MessageHandler)> {
        let mut drained: Vec<(String, MessageHandler)> = self
            .entries
            .lock()
            .await
            .drain()
            .map(|(topic, entry)| (topic, entry.handler))
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    /// Cancel and forget every subscription.
    pub async fn clear(&self) {
        let entries: Vec<Entry> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        for entry in &entries {
            self.connection.unsubscribe(&entry.handle).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
