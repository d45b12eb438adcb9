//! Event feed for observing registry and model changes.
//!
//! The registry emits an event after every committed mutation, and the sync
//! layer emits conflict and completion events on the same feed. Subscribers
//! get a plain [`Receiver`] and may live on any thread. Listeners are called
//! synchronously on the emitting thread, before `emit` returns.
//!
//! ```rust
//! use safesync_core::{EventFeed, RegistryEvent};
//!
//! let feed = EventFeed::new();
//! let rx = feed.subscribe();
//!
//! feed.emit(RegistryEvent::Added { name: "Personal".into() });
//! assert_eq!(rx.try_recv().unwrap().name(), "Personal");
//! ```

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// A change observed on the registry or one of its databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A database was created, imported or duplicated.
    Added {
        /// Friendly name.
        name: String,
    },
    /// A database changed its friendly name.
    Renamed {
        /// Previous name.
        old: String,
        /// New name.
        new: String,
    },
    /// A database was deleted.
    Removed {
        /// Friendly name.
        name: String,
    },
    /// A database was unlocked.
    Opened {
        /// Friendly name.
        name: String,
    },
    /// A database was locked again.
    Closed {
        /// Friendly name.
        name: String,
    },
    /// A local edit was committed to an open database.
    Changed {
        /// Friendly name.
        name: String,
    },
    /// A sync found local and remote edits that need resolution.
    SyncConflictDetected {
        /// Friendly name.
        name: String,
    },
    /// A sync finished and local and remote agree.
    SyncCompleted {
        /// Friendly name.
        name: String,
        /// Remote revision both sides now share.
        revision: String,
    },
}

impl RegistryEvent {
    /// Returns the friendly name the event is about (the new name for renames).
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            RegistryEvent::Added { name }
            | RegistryEvent::Removed { name }
            | RegistryEvent::Opened { name }
            | RegistryEvent::Closed { name }
            | RegistryEvent::Changed { name }
            | RegistryEvent::SyncConflictDetected { name }
            | RegistryEvent::SyncCompleted { name, .. } => name,
            RegistryEvent::Renamed { new, .. } => new,
        }
    }
}

/// A callback run for every event on the emitting thread.
pub type EventListener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Handle returned by [`EventFeed::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fans events out to every live subscriber and listener.
///
/// Emission never blocks on subscribers: they are unbounded channels.
/// Subscribers whose receiver was dropped are pruned on the next emit.
///
/// Listeners run inline. A model emits [`RegistryEvent::Changed`] while it is
/// still locked, so a listener must not call back into the model.
pub struct EventFeed {
    subscribers: RwLock<Vec<Sender<RegistryEvent>>>,
    listeners: RwLock<Vec<(ListenerId, EventListener)>>,
    next_listener: AtomicU64,
    history: RwLock<VecDeque<RegistryEvent>>,
    max_history: usize,
}

impl EventFeed {
    /// Creates a feed that remembers the last 256 events.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(256)
    }

    /// Creates a feed with a specific history limit.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Registers a callback run for every future event.
    pub fn listen<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was already removed.
    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(other, _)| *other != id);
        listeners.len() != before
    }

    /// Delivers an event to all listeners, then to all subscribers.
    pub fn emit(&self, event: RegistryEvent) {
        {
            let mut history = self.history.write();
            history.push_back(event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        // Called without the lock held so a listener may (un)register others.
        let listeners: Vec<EventListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns up to `limit` of the most recent events, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<RegistryEvent> {
        let history = self.history.read();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Returns the number of events in history.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Returns the number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("subscribers", &self.subscriber_count())
            .field("listeners", &self.listener_count())
            .field("history_len", &self.history_len())
            .finish()
    }
}
