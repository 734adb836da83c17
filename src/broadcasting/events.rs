use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::ingest::{IngestListEntry, IngestProgress};
use super::types::{ArchivingState, BroadcastState, Operation};

/// Handle returned by `Observers::subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ObserverList<E> {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, Callback<E>)>,
    holds: usize,
    held: Vec<E>,
}

/// Registered callbacks for one event type, invoked synchronously in registration order.
///
/// Cloning yields another handle to the same list.
pub struct Observers<E> {
    inner: Arc<Mutex<ObserverList<E>>>,
}

impl<E> Clone for Observers<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("len", &self.len()).finish()
    }
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObserverList {
                next_id: 0,
                callbacks: Vec::new(),
                holds: 0,
                held: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut list = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = SubscriptionId(list.next_id);
        list.next_id += 1;
        list.callbacks.push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = list.callbacks.len();
        list.callbacks.retain(|(existing, _)| *existing != id);
        list.callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .callbacks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events buffered by an outstanding hold
    pub fn held_len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .held
            .len()
    }
}

impl<E: Clone> Observers<E> {
    /// Deliver `event` to every observer, or buffer it while a hold is outstanding.
    ///
    /// The list is snapshotted first so callbacks may subscribe or unsubscribe.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = {
            let mut list = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if list.holds > 0 {
                list.held.push(event.clone());
                return;
            }
            list.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Buffer events until the returned guard is dropped.
    ///
    /// Holds nest; buffered events are delivered in order when the last one is released.
    pub fn hold(&self) -> HeldEvents<E> {
        let mut list = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        list.holds += 1;
        HeldEvents {
            observers: self.clone(),
        }
    }

    fn release(&self) {
        let (events, callbacks): (Vec<E>, Vec<Callback<E>>) = {
            let mut list = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            list.holds = list.holds.saturating_sub(1);
            if list.holds > 0 {
                return;
            }
            (
                std::mem::take(&mut list.held),
                list.callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            )
        };
        for event in &events {
            for callback in &callbacks {
                callback(event);
            }
        }
    }
}

/// Outstanding hold on an observer list; delivers the buffered events on drop
#[must_use = "events are delivered when the hold is dropped"]
pub struct HeldEvents<E: Clone> {
    observers: Observers<E>,
}

impl<E: Clone> Drop for HeldEvents<E> {
    fn drop(&mut self) {
        self.observers.release();
    }
}

/// Lifecycle notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BroadcastEvent {
    StateChanged(StateChangedEvent),
    IngestListReceived(IngestListEvent),
    GameNameListReceived(GameNameListEvent),
    ArchivingStateChanged(ArchivingStateEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub session_id: Option<Uuid>,
    pub previous: BroadcastState,
    pub current: BroadcastState,
    /// Operations valid in `current`
    pub allowed_operations: Vec<Operation>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestListEvent {
    pub session_id: Option<Uuid>,
    pub servers: Vec<IngestListEntry>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameNameListEvent {
    pub session_id: Option<Uuid>,
    pub query: String,
    pub names: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivingStateEvent {
    pub session_id: Option<Uuid>,
    pub archiving: ArchivingState,
    pub timestamp: DateTime<Utc>,
}

/// Ingest probe notification: one per probe state change, plus one per measured progress step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub probe_id: Uuid,
    pub progress: IngestProgress,
    pub timestamp: DateTime<Utc>,
}

impl IngestEvent {
    pub fn new(probe_id: Uuid, progress: IngestProgress) -> Self {
        Self {
            probe_id,
            progress,
            timestamp: Utc::now(),
        }
    }
}
