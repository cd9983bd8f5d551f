//! Sync Events
//!
//! Notifications emitted on local writes, deletes and clears so another
//! instance can mirror them. Delivery is in-process: registered callbacks run
//! synchronously and a broadcast channel feeds async consumers. Transport
//! between instances is left to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEventKind {
    Set { key: String, value: Bytes },
    Delete { key: String },
    Clear,
}

/// Where the change originated, relative to the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(flatten)]
    pub kind: SyncEventKind,
    pub timestamp: DateTime<Utc>,
    pub source: SyncSource,
    /// Id of the manager instance that made the change
    pub origin: Uuid,
}

impl SyncEvent {
    pub fn local(kind: SyncEventKind, origin: Uuid) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            source: SyncSource::Local,
            origin,
        }
    }

    /// Key touched by the event, if any
    pub fn key(&self) -> Option<&str> {
        match &self.kind {
            SyncEventKind::Set { key, .. } | SyncEventKind::Delete { key } => Some(key),
            SyncEventKind::Clear => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            SyncEventKind::Set { .. } => "set",
            SyncEventKind::Delete { .. } => "delete",
            SyncEventKind::Clear => "clear",
        }
    }
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;
type Listeners = RwLock<Vec<(u64, Listener)>>;

/// Fan-out point for sync events
pub(crate) struct SyncHub {
    listeners: Arc<Listeners>,
    next_id: AtomicU64,
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
            tx,
        }
    }

    pub(crate) fn subscribe<F>(&self, listener: F) -> SyncSubscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(listener)));
        SyncSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub(crate) fn receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // Snapshot so listeners may subscribe/unsubscribe re-entrantly
        let listeners: Vec<Listener> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&event);
        }

        let event_type = event.event_type();
        if self.tx.send(event).is_err() {
            debug!(event_type, "No sync receivers");
        }
    }
}

/// Handle returned by `on_sync`; call [`unsubscribe`](Self::unsubscribe) to
/// stop receiving events
#[must_use = "dropping the subscription keeps the listener registered"]
pub struct SyncSubscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl SyncSubscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for SyncSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSubscription").field("id", &self.id).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
