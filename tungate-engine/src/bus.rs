//! In-process publish/subscribe
//!
//! Each delivery runs in its own task, so a slow or panicking listener never
//! holds up other listeners or later events. There is no replay: a listener
//! only sees events published after it subscribed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::event::{Event, EventKind};

/// Receives events from the [`EventBus`]
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Handle one event
    async fn handle_event(&self, event: &Event);
}

/// Fan-out event dispatcher
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Arc<dyn EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`
    ///
    /// Registering the same listener twice delivers each event to it twice.
    pub fn subscribe(&self, kind: EventKind, listener: Arc<dyn EventListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.entry(kind).or_default().push(listener),
            Err(poisoned) => poisoned
                .into_inner()
                .entry(kind)
                .or_default()
                .push(listener),
        }
    }

    /// Number of listeners for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.snapshot(kind).len()
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Arc<dyn EventListener>> {
        let listeners = match self.listeners.read() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.get(&kind).cloned().unwrap_or_default()
    }

    /// Deliver `event` to every listener subscribed to its kind
    ///
    /// Must be called from within a tokio runtime. The returned handle may be
    /// dropped for fire-and-forget delivery.
    pub fn publish(&self, event: Event) -> Delivery {
        let listeners = self.snapshot(event.kind);
        log::debug!(
            "Publishing {} to {} listener(s)",
            event.kind,
            listeners.len()
        );

        let event = Arc::new(event);
        let tasks = listeners
            .into_iter()
            .map(|listener| {
                let event = event.clone();
                tokio::spawn(async move { listener.handle_event(&event).await })
            })
            .collect();

        Delivery {
            kind: event.kind,
            tasks,
        }
    }
}

/// Handle on the listener tasks started by one [`EventBus::publish`]
#[must_use = "dropping a Delivery detaches its listener tasks"]
pub struct Delivery {
    kind: EventKind,
    tasks: Vec<JoinHandle<()>>,
}

impl Delivery {
    /// Number of listeners the event was handed to
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every listener task; panics are logged, not propagated
    pub async fn join(self) {
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                log::error!("Listener for {} failed: {}", self.kind, e);
            }
        }
    }
}
