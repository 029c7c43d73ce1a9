//! CLA Manager: single point of truth for "is there a channel to peer X"
//!
//! The manager owns every live channel, keyed by the peer's channel key, and
//! dispatches open requests to the convergence layer named in the peer EID.
//!
//! Concurrent opens towards the same peer are collapsed: the first caller
//! registers an in-flight entry and spawns the single transport attempt, later
//! callers subscribe to the same outcome.
//!
//! ```text
//! open_channel(E) ─┐
//!                  │                           ConvergenceLayer::open(E)
//! open_channel(E) ─┼──► in_flight[E] ─────────► (exactly one attempt)
//!                  │        │                           │
//! open_channel(E) ─┘        ▼                           ▼
//!                   [all callers get the     register + ChannelOpened
//!                    same channel or error]◄────────────┘
//! ```
//!
//! Each registered channel gets one task that publishes its received bundles
//! and, once the channel is gone, removes it and publishes `ChannelClosed`.
//! Open and close events are only published at these registry mutations.

use super::{ChannelStream, ClaChannel, ClaError, ConvergenceLayer};
use crate::bus::{EventBus, NodeEvent};
use crate::eid::Eid;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

type OpenOutcome = Result<Arc<dyn ClaChannel>, ClaError>;

/// Counters for monitoring open deduplication
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    /// Calls to `open_channel`
    pub open_requests: u64,
    /// Transport-level open attempts started
    pub transport_opens: u64,
    /// Requests served by an existing channel or an in-flight attempt
    pub coalesced: u64,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<String, Arc<dyn ClaChannel>>,
    in_flight: HashMap<String, broadcast::Sender<OpenOutcome>>,
}

struct ManagerInner {
    bus: Arc<EventBus>,
    clas: RwLock<HashMap<String, Arc<dyn ConvergenceLayer>>>,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    open_requests: AtomicU64,
    transport_opens: AtomicU64,
    coalesced: AtomicU64,
}

#[derive(Clone)]
pub struct ClaManager {
    inner: Arc<ManagerInner>,
}

enum Lookup {
    Ready(Arc<dyn ClaChannel>),
    Wait(broadcast::Receiver<OpenOutcome>),
    Started(broadcast::Receiver<OpenOutcome>),
    Stale(Arc<dyn ClaChannel>),
}

impl ClaManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                bus,
                clas: RwLock::new(HashMap::new()),
                registry: Mutex::new(Registry::default()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                open_requests: AtomicU64::new(0),
                transport_opens: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Register a convergence layer under its name
    pub fn add_cla(&self, cla: Arc<dyn ConvergenceLayer>) -> Result<(), ClaError> {
        let name = cla.name().to_string();
        let mut clas = self.inner.clas.write();
        if clas.contains_key(&name) {
            return Err(ClaError::Transport(format!("{} already registered", name)));
        }
        clas.insert(name.clone(), cla);
        info!(cla = %name, "Convergence layer registered");
        Ok(())
    }

    pub fn cla_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.clas.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn cla(&self, name: &str) -> Result<Arc<dyn ConvergenceLayer>, ClaError> {
        self.inner
            .clas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ClaError::UnknownTransport(name.to_string()))
    }

    /// Start a convergence layer and adopt every channel it produces
    pub async fn start_cla(&self, name: &str) -> Result<(), ClaError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ClaError::Cancelled);
        }
        let cla = self.cla(name)?;
        let stream = cla.start().await?;
        let inner = self.inner.clone();
        let cla_name = name.to_string();
        self.inner
            .tasks
            .spawn(async move { inner.accept_loop(cla_name, stream).await });
        info!(cla = %name, "Convergence layer started");
        Ok(())
    }

    /// Stop a convergence layer from producing new channels
    pub async fn stop_cla(&self, name: &str) -> Result<(), ClaError> {
        let cla = self.cla(name)?;
        cla.stop().await;
        info!(cla = %name, "Convergence layer stopped");
        Ok(())
    }

    /// Channel to `eid`, opening one if needed.
    ///
    /// Fails with `UnknownTransport` when no convergence layer handles the
    /// EID. Transport failures are returned as-is; nothing is retried here.
    pub async fn open_channel(&self, eid: &Eid) -> Result<Arc<dyn ClaChannel>, ClaError> {
        self.inner.open_requests.fetch_add(1, Ordering::Relaxed);
        let key = eid.channel_key();

        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(ClaError::Cancelled);
            }

            let lookup = {
                let mut registry = self.inner.registry.lock();
                match registry.channels.get(&key).cloned() {
                    Some(channel) if channel.is_closed() => {
                        registry.channels.remove(&key);
                        Lookup::Stale(channel)
                    }
                    Some(channel) => Lookup::Ready(channel),
                    None => match registry.in_flight.get(&key) {
                        Some(tx) => Lookup::Wait(tx.subscribe()),
                        None => {
                            let cla_name = eid
                                .cla_name()
                                .ok_or_else(|| ClaError::UnknownTransport(eid.scheme().to_string()))?;
                            let cla = self.cla(cla_name)?;
                            let (tx, rx) = broadcast::channel(1);
                            registry.in_flight.insert(key.clone(), tx);
                            self.inner.transport_opens.fetch_add(1, Ordering::Relaxed);

                            let inner = self.inner.clone();
                            let peer = eid.peer();
                            let attempt_key = key.clone();
                            self.inner.tasks.spawn(async move {
                                inner.run_open(cla, peer, attempt_key).await;
                            });
                            debug!(eid = %eid, "Opening channel");
                            Lookup::Started(rx)
                        }
                    },
                }
            };

            match lookup {
                Lookup::Ready(channel) => {
                    self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    return Ok(channel);
                }
                Lookup::Wait(rx) => {
                    self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(eid = %eid, "Joining in-flight open");
                    return wait_outcome(rx).await;
                }
                // The producer waits like everyone else
                Lookup::Started(rx) => return wait_outcome(rx).await,
                Lookup::Stale(channel) => {
                    // Announce the dead channel before a new one can be opened
                    self.inner.bus.publish(NodeEvent::ChannelClosed {
                        eid: channel.eid().clone(),
                    });
                }
            }
        }
    }

    /// Open channel to `eid`, if any
    pub fn channel(&self, eid: &Eid) -> Option<Arc<dyn ClaChannel>> {
        self.inner
            .registry
            .lock()
            .channels
            .get(&eid.channel_key())
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Close the channel to `eid`; false if there was none
    pub fn close_channel(&self, eid: &Eid) -> bool {
        match self.channel(eid) {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Peers with a registered channel
    pub fn channels(&self) -> Vec<Eid> {
        self.inner
            .registry
            .lock()
            .channels
            .values()
            .map(|c| c.eid().clone())
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.registry.lock().channels.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.lock().in_flight.len()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            open_requests: self.inner.open_requests.load(Ordering::Relaxed),
            transport_opens: self.inner.transport_opens.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Cancel in-flight opens, stop every convergence layer and close every
    /// channel. Returns once all channel tasks have finished.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down CLA manager");
        self.inner.shutdown.cancel();

        let clas: Vec<Arc<dyn ConvergenceLayer>> = self.inner.clas.read().values().cloned().collect();
        for cla in clas {
            cla.stop().await;
        }

        let channels: Vec<Arc<dyn ClaChannel>> =
            self.inner.registry.lock().channels.values().cloned().collect();
        for channel in channels {
            channel.close();
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("CLA manager stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl ManagerInner {
    /// The single transport attempt behind an in-flight entry
    async fn run_open(self: Arc<Self>, cla: Arc<dyn ConvergenceLayer>, peer: Eid, key: String) {
        // Dropping the transport future on shutdown cancels the attempt
        let outcome = tokio::select! {
            result = cla.open(&peer) => result,
            _ = self.shutdown.cancelled() => Err(ClaError::Cancelled),
        };

        let outcome = match outcome {
            Ok(channel) => self.register(channel, Some(&key)),
            Err(e) => {
                warn!(eid = %peer, error = %e, "Channel open failed");
                let tx = self.registry.lock().in_flight.remove(&key);
                let outcome = Err(e);
                if let Some(tx) = tx {
                    let _ = tx.send(outcome.clone());
                }
                outcome
            }
        };
        if let Ok(channel) = &outcome {
            debug!(eid = %channel.eid(), "Channel open completed");
        }
    }

    /// Adopt a channel, keeping at most one per peer.
    ///
    /// Completes the in-flight entry `in_flight_key` if given. A newcomer for
    /// a peer that already has a live channel is closed and the existing
    /// channel is the outcome.
    fn register(self: &Arc<Self>, channel: Arc<dyn ClaChannel>, in_flight_key: Option<&str>) -> OpenOutcome {
        let key = channel.eid().channel_key();
        let (waiters, outcome, adopted) = {
            let mut registry = self.registry.lock();
            let waiters = in_flight_key.and_then(|k| registry.in_flight.remove(k));

            if self.shutdown.is_cancelled() {
                (waiters, Err(ClaError::Cancelled), false)
            } else {
                match registry.channels.get(&key) {
                    Some(existing) if !existing.is_closed() => (waiters, Ok(existing.clone()), false),
                    _ => {
                        registry.channels.insert(key.clone(), channel.clone());
                        (waiters, Ok(channel.clone()), true)
                    }
                }
            }
        };

        if adopted {
            info!(eid = %channel.eid(), "Channel opened");
            self.bus.publish(NodeEvent::ChannelOpened {
                eid: channel.eid().clone(),
                channel: channel.clone(),
            });
            let inner = self.clone();
            let watched = channel.clone();
            self.tasks
                .spawn(async move { inner.watch_channel(watched, key).await });
        } else {
            debug!(eid = %channel.eid(), "Duplicate or late channel rejected");
            channel.close();
        }

        if let Some(tx) = waiters {
            let _ = tx.send(outcome.clone());
        }
        outcome
    }

    /// Pump received bundles until the channel ends, then deregister it
    async fn watch_channel(self: Arc<Self>, channel: Arc<dyn ClaChannel>, key: String) {
        let eid = channel.eid().clone();
        let mut bundles = channel.recv_bundles();

        loop {
            tokio::select! {
                biased;
                next = bundles.next() => match next {
                    Some(Ok(bundle)) => {
                        debug!(eid = %eid, bid = %bundle.bid, "Bundle received");
                        self.bus.publish(NodeEvent::BundleReceived {
                            eid: eid.clone(),
                            bundle,
                        });
                    }
                    Some(Err(e)) => {
                        warn!(eid = %eid, error = %e, "Channel receive failed");
                        break;
                    }
                    None => break,
                },
                _ = channel.closed() => break,
            }
        }
        channel.close();

        let removed = {
            let mut registry = self.registry.lock();
            match registry.channels.get(&key) {
                Some(current) if same_channel(current, &channel) => {
                    registry.channels.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!(eid = %eid, "Channel closed");
            self.bus.publish(NodeEvent::ChannelClosed { eid });
        }
    }

    async fn accept_loop(self: Arc<Self>, cla_name: String, mut stream: ChannelStream) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(channel) => {
                        debug!(cla = %cla_name, eid = %channel.eid(), "Inbound channel");
                        let _ = self.register(channel, None);
                    }
                    None => break,
                },
            }
        }
        debug!(cla = %cla_name, "Inbound channel stream ended");
    }
}

async fn wait_outcome(mut rx: broadcast::Receiver<OpenOutcome>) -> OpenOutcome {
    rx.recv().await.unwrap_or(Err(ClaError::Cancelled))
}

fn same_channel(a: &Arc<dyn ClaChannel>, b: &Arc<dyn ClaChannel>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
