//! Sync events and the fan-out that delivers them.
//!
//! The bus is a live feed. Events emitted while nobody listens are gone.

use crate::discovery::ServerInfo;
use crate::lesson::Lesson;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Events published while syncing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Lessons we did not have before arrived from a peer.
    LessonsUpdated {
        /// Only lessons new to the local collection.
        lessons: Vec<Lesson>,
    },
    /// The set of discovered peers changed.
    PeersChanged {
        /// Full current list.
        servers: Vec<ServerInfo>,
    },
    /// Starting or running a session failed.
    SessionFailed {
        /// Human-readable cause.
        reason: String,
    },
}

impl SyncEvent {
    /// Short name for logs, same as the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::LessonsUpdated { .. } => "lessonsUpdated",
            SyncEvent::PeersChanged { .. } => "peersChanged",
            SyncEvent::SessionFailed { .. } => "sessionFailed",
        }
    }
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_id: BTreeMap<u64, Listener>,
}

fn lock(listeners: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    listeners.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fan-out of [`SyncEvent`]s to registered listeners, in registration order.
///
/// Cloning yields another handle to the same listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
}

/// Keeps a listener registered. Dropping it removes the listener.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    listeners: Weak<Mutex<Listeners>>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).by_id.remove(&self.id);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.by_id.insert(id, Arc::new(listener));
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).by_id.len()
    }

    /// Deliver `event` to every current listener and return how many got it.
    ///
    /// Listeners run outside the lock, so they may subscribe or drop
    /// subscriptions themselves. Those changes apply from the next event.
    pub fn emit(&self, event: SyncEvent) -> usize {
        let snapshot: Vec<Listener> = lock(&self.listeners).by_id.values().cloned().collect();
        for listener in &snapshot {
            listener(&event);
        }
        snapshot.len()
    }
}
