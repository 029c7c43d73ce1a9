//! Event bus
//!
//! Typed publish/subscribe between node components. A subscriber registers a
//! handler per event kind, with an [`Affinity`] choosing where it runs:
//!
//! - `Inline` handlers run on the publishing call, after the bus lock is
//!   released. Keep them fast and non-blocking.
//! - `Pool` handlers run on the blocking pool, one at a time per subscriber
//!   (FIFO), at most `workers` across all subscribers.
//!
//! A failing or panicking handler is logged and counted here; the publisher
//! and every other subscriber are unaffected.

pub mod events;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

pub use events::{EventKind, NodeEvent};

/// Handler invoked for each matching event
pub type EventHandler = Arc<dyn Fn(&NodeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Default number of concurrently running pool handlers
pub const DEFAULT_POOL_WORKERS: usize = 4;

/// Where a handler runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    /// Synchronously on the publishing call
    #[default]
    Inline,
    /// Asynchronously on the bounded worker pool
    Pool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Pool affinity requires a running tokio runtime")]
    NoRuntime,
}

struct Registration {
    kind: EventKind,
    affinity: Affinity,
    handler: EventHandler,
}

type Job = (NodeEvent, EventHandler);

struct SubscriberEntry {
    registrations: Vec<Registration>,
    /// Present once the subscriber has a pool registration
    queue: Option<mpsc::UnboundedSender<Job>>,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<String, SubscriberEntry>>,
    pool: Arc<Semaphore>,
    workers: usize,
    published: AtomicU64,
    handler_failures: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            subscribers: RwLock::new(HashMap::new()),
            pool: Arc::new(Semaphore::new(workers)),
            workers,
            published: AtomicU64::new(0),
            handler_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind `handler` to events of `kind` for `subscriber`.
    ///
    /// A subscriber may register several kinds; `unsubscribe` releases all
    /// of them at once.
    pub fn subscribe<F>(
        &self,
        subscriber: &str,
        kind: EventKind,
        affinity: Affinity,
        handler: F,
    ) -> Result<(), BusError>
    where
        F: Fn(&NodeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.write();
        let entry = subscribers
            .entry(subscriber.to_string())
            .or_insert_with(|| SubscriberEntry {
                registrations: Vec::new(),
                queue: None,
            });

        if affinity == Affinity::Pool && entry.queue.is_none() {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;
            let (tx, rx) = mpsc::unbounded_channel();
            runtime.spawn(run_worker(
                subscriber.to_string(),
                rx,
                self.pool.clone(),
                self.handler_failures.clone(),
            ));
            entry.queue = Some(tx);
        }

        entry.registrations.push(Registration {
            kind,
            affinity,
            handler: Arc::new(handler),
        });
        debug!(subscriber, kind = %kind, affinity = ?affinity, "Subscribed");
        Ok(())
    }

    /// Release every registration of `subscriber`; false if it had none.
    ///
    /// Events already queued for its pool handlers are still delivered.
    pub fn unsubscribe(&self, subscriber: &str) -> bool {
        let removed = self.subscribers.write().remove(subscriber).is_some();
        if removed {
            debug!(subscriber, "Unsubscribed");
        }
        removed
    }

    /// Dispatch `event` to every handler registered for its kind.
    ///
    /// Returns the number of handlers it was dispatched to.
    pub fn publish(&self, event: NodeEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        let mut inline: Vec<(String, EventHandler)> = Vec::new();
        let mut dispatched = 0;

        {
            let subscribers = self.subscribers.read();
            for (name, entry) in subscribers.iter() {
                for registration in entry.registrations.iter().filter(|r| r.kind == kind) {
                    match registration.affinity {
                        Affinity::Inline => {
                            inline.push((name.clone(), registration.handler.clone()));
                            dispatched += 1;
                        }
                        Affinity::Pool => {
                            let queued = entry
                                .queue
                                .as_ref()
                                .map(|q| q.send((event.clone(), registration.handler.clone())).is_ok())
                                .unwrap_or(false);
                            if queued {
                                dispatched += 1;
                            } else {
                                warn!(subscriber = %name, kind = %kind, "Pool worker gone, event dropped");
                            }
                        }
                    }
                }
            }
        }

        for (name, handler) in inline {
            if let Err(reason) = invoke(&handler, &event) {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = %name, kind = %kind, error = %reason, "Event handler failed");
            }
        }

        debug!(kind = %kind, handlers = dispatched, "Event published");
        dispatched
    }

    /// Number of subscribers with at least one registration
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_subscribed(&self, subscriber: &str) -> bool {
        self.subscribers.read().contains_key(subscriber)
    }

    /// Total events published
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Handlers that returned an error or panicked
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.subscribers.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_WORKERS)
    }
}

/// Run a handler, turning errors and panics into a message
fn invoke(handler: &EventHandler, event: &NodeEvent) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("handler panicked: {}", message))
        }
    }
}

/// Per-subscriber FIFO worker for pool handlers
async fn run_worker(
    subscriber: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
    pool: Arc<Semaphore>,
    failures: Arc<AtomicU64>,
) {
    while let Some((event, handler)) = rx.recv().await {
        let Ok(_permit) = pool.clone().acquire_owned().await else {
            break;
        };
        let kind = event.kind();
        let outcome = tokio::task::spawn_blocking(move || invoke(&handler, &event)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = %subscriber, kind = %kind, error = %reason, "Event handler failed");
            }
            Err(e) => {
                failures.fetch_add(1, Ordering::Relaxed);
                error!(subscriber = %subscriber, kind = %kind, error = %e, "Event handler task aborted");
            }
        }
    }
    debug!(subscriber = %subscriber, "Pool worker stopped");
}
