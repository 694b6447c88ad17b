use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::handle::ChildState;

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Status and log events flowing out of the supervisor.
#[derive(Debug, Clone)]
pub enum Event {
    StatusChanged {
        server: String,
        old: ChildState,
        new: ChildState,
        error: Option<String>,
    },
    LogLine {
        server: String,
        line: String,
    },
    ToolsUpdated {
        server: String,
        count: usize,
    },
    Error {
        server: String,
        message: String,
    },
}

/// Fan-out bus between the supervisor and any observers.
///
/// Each subscriber reads from its own bounded queue; a subscriber that
/// falls behind loses the oldest events rather than blocking publication.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Publish without blocking; an event with no subscribers is dropped.
    pub fn publish(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Register a synchronous callback, driven by a drainer task. Lag is
    /// reported once per gap with the number of dropped events.
    pub fn subscribe_fn<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        tracing::warn!(dropped, "event subscriber lagged; oldest events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop accepting publications; drainer tasks finish their queues and
    /// exit once the bus is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
