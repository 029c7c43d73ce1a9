// In-memory convergence layer
//
// Channels are pairs of in-process queues. Latency and failure of open
// attempts are programmable, and every attempt is counted, which makes this
// the transport of choice for driving the engine without sockets.
//
// Closing either end of a pair closes both. stop() ends the inbound stream
// but leaves channels already handed out open.

use super::{BundleStream, ChannelCore, ChannelState, ChannelStream, ClaChannel, ClaError, ConvergenceLayer};
use crate::bundle::Bundle;
use crate::eid::{ClaEid, Eid};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One end of an in-memory link
pub struct MemoryChannel {
    core: ChannelCore,
    link: CancellationToken,
    outbound: mpsc::UnboundedSender<Bundle>,
    inbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Bundle>>>,
    sent: AtomicU64,
}

impl MemoryChannel {
    /// Two connected ends; `a` talks to the peer `a_peer`, `b` to `b_peer`
    pub fn pair(a_peer: Eid, b_peer: Eid) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let link = CancellationToken::new();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = Arc::new(MemoryChannel {
            core: ChannelCore::new(a_peer),
            link: link.clone(),
            outbound: a_tx,
            inbound: Arc::new(tokio::sync::Mutex::new(a_rx)),
            sent: AtomicU64::new(0),
        });
        let b = Arc::new(MemoryChannel {
            core: ChannelCore::new(b_peer),
            link,
            outbound: b_tx,
            inbound: Arc::new(tokio::sync::Mutex::new(b_rx)),
            sent: AtomicU64::new(0),
        });
        a.core.activate();
        b.core.activate();
        (a, b)
    }

    /// Bundles accepted by `send` so far
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ClaChannel for MemoryChannel {
    fn eid(&self) -> &Eid {
        self.core.eid()
    }

    fn state(&self) -> ChannelState {
        if self.link.is_cancelled() {
            ChannelState::Closed
        } else {
            self.core.state()
        }
    }

    fn recv_bundles(&self) -> BundleStream {
        let inbound = self.inbound.clone();
        let link = self.link.clone();
        stream::unfold((inbound, link), |(inbound, link)| async move {
            let next = {
                let mut rx = inbound.lock().await;
                tokio::select! {
                    biased;
                    bundle = rx.recv() => bundle,
                    _ = link.cancelled() => None,
                }
            };
            next.map(|bundle| (Ok(bundle), (inbound, link)))
        })
        .boxed()
    }

    async fn send(&self, bundle: Bundle) -> Result<(), ClaError> {
        if self.is_closed() {
            return Err(ClaError::ChannelClosed);
        }
        self.outbound
            .send(bundle)
            .map_err(|_| ClaError::ChannelClosed)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        if self.core.close() {
            debug!(eid = %self.core.eid(), "Memory channel closed");
        }
        self.link.cancel();
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.core.closed() => {}
            _ = self.link.cancelled() => {
                self.core.close();
            }
        }
    }
}

/// Convergence layer backed by in-process queues
pub struct MemoryCla {
    name: String,
    /// Locator this node is known by on the remote ends
    self_locator: String,
    open_delay: Mutex<Duration>,
    failure: Mutex<Option<String>>,
    open_attempts: AtomicUsize,
    remotes: Mutex<HashMap<String, Arc<MemoryChannel>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Arc<dyn ClaChannel>>>>,
}

impl MemoryCla {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            self_locator: "localhost:0".to_string(),
            open_delay: Mutex::new(Duration::ZERO),
            failure: Mutex::new(None),
            open_attempts: AtomicUsize::new(0),
            remotes: Mutex::new(HashMap::new()),
            inbound: Mutex::new(None),
        }
    }

    /// Delay every subsequent open attempt
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Make subsequent open attempts fail with this reason; `None` to succeed
    pub fn set_failure(&self, reason: Option<&str>) {
        *self.failure.lock() = reason.map(str::to_string);
    }

    /// Number of `open` calls that reached this transport
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Remote end of the channel opened towards `peer`
    pub fn remote_end(&self, peer: &Eid) -> Option<Arc<MemoryChannel>> {
        self.remotes.lock().get(&peer.channel_key()).cloned()
    }

    /// Simulate an inbound connection from `peer`.
    ///
    /// The local end goes out on the stream returned by `start`; the remote
    /// end is returned so the caller can act as the peer.
    pub fn accept(&self, peer: &Eid) -> Result<Arc<MemoryChannel>, ClaError> {
        let inbound = self.inbound.lock();
        let tx = inbound
            .as_ref()
            .ok_or_else(|| ClaError::Transport(format!("{} is not started", self.name)))?;
        let (local, remote) = MemoryChannel::pair(peer.clone(), self.self_eid());
        tx.send(local as Arc<dyn ClaChannel>)
            .map_err(|_| ClaError::Transport(format!("{} is stopping", self.name)))?;
        Ok(remote)
    }

    fn self_eid(&self) -> Eid {
        Eid::Cla(ClaEid {
            cla_name: self.name.clone(),
            locator: self.self_locator.clone(),
            sink: String::new(),
        })
    }
}

#[async_trait]
impl ConvergenceLayer for MemoryCla {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<ChannelStream, ClaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inbound = self.inbound.lock();
            if inbound.is_some() {
                return Err(ClaError::Transport(format!("{} already started", self.name)));
            }
            *inbound = Some(tx);
        }
        debug!(cla = %self.name, "Memory CLA started");
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|channel| (channel, rx))
        })
        .boxed())
    }

    async fn stop(&self) {
        if self.inbound.lock().take().is_some() {
            debug!(cla = %self.name, "Memory CLA stopped");
        }
    }

    async fn open(&self, peer: &Eid) -> Result<Arc<dyn ClaChannel>, ClaError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failure.lock().clone();
        if let Some(reason) = failure {
            return Err(ClaError::Connection(reason));
        }

        let (local, remote) = MemoryChannel::pair(peer.clone(), self.self_eid());
        self.remotes.lock().insert(peer.channel_key(), remote);
        Ok(local)
    }
}
