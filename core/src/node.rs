// Node — the context object wiring every component together
//
// One NodeContext (live config, event bus, local address view) is built at
// startup and handed to each component; nothing in the crate is a global.
//
// forward() is the single entry point for moving a bundle one step:
//   expired?        -> BundleExpired
//   local dest?     -> registrar sink
//   link-local hop? -> existing channel
//   otherwise       -> connection agent opens one, then send

use crate::agent::ConnectionAgent;
use crate::bundle::{now_ms, Bundle};
use crate::bus::{Affinity, EventBus, EventKind, NodeEvent};
use crate::cla::{ClaChannel, ClaManager, ConvergenceLayer};
use crate::config::NodeConfig;
use crate::eid::local::LocalAddresses;
use crate::eid::Eid;
use crate::registrar::Registrar;
use crate::routing::LinkLocalRouting;
use crate::NodeError;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const FORWARDER: &str = "node-forwarder";

/// Shared state every component is built from
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<NodeConfig>,
    pub bus: Arc<EventBus>,
    pub local: LocalAddresses,
}

impl NodeContext {
    pub fn new(config: Arc<NodeConfig>) -> Self {
        let bus = Arc::new(EventBus::new(config.event_pool_workers.get()));
        let local = LocalAddresses::new(config.clone());
        Self { config, bus, local }
    }
}

/// Outcome of a successful `forward`
#[derive(Debug, Clone, PartialEq)]
pub enum Forwarded {
    /// Handed to a local sink
    Delivered,
    /// Sent on the channel to `next_hop`
    Sent { next_hop: Eid },
}

struct NodeInner {
    context: NodeContext,
    manager: ClaManager,
    agent: ConnectionAgent,
    routing: LinkLocalRouting,
    registrar: Arc<Registrar>,
    running: RwLock<bool>,
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: Arc<NodeConfig>) -> Self {
        let context = NodeContext::new(config);
        let manager = ClaManager::new(context.bus.clone());
        let agent = ConnectionAgent::new(context.config.clone(), context.bus.clone(), manager.clone());
        let routing = LinkLocalRouting::new(context.config.clone(), context.bus.clone());
        let registrar = Arc::new(Registrar::new(context.config.clone(), context.local.clone()));

        Self {
            inner: Arc::new(NodeInner {
                context,
                manager,
                agent,
                routing,
                registrar,
                running: RwLock::new(false),
            }),
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.inner.context
    }

    pub fn config(&self) -> &Arc<NodeConfig> {
        &self.inner.context.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.context.bus
    }

    pub fn manager(&self) -> &ClaManager {
        &self.inner.manager
    }

    pub fn agent(&self) -> &ConnectionAgent {
        &self.inner.agent
    }

    pub fn routing(&self) -> &LinkLocalRouting {
        &self.inner.routing
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.inner.registrar
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.read()
    }

    /// Register a convergence layer with the manager
    pub fn add_cla(&self, cla: Arc<dyn ConvergenceLayer>) -> Result<(), NodeError> {
        Ok(self.inner.manager.add_cla(cla)?)
    }

    /// Activate the reactive components and inbound forwarding.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(&self) -> Result<(), NodeError> {
        let mut running = self.inner.running.write();
        if *running {
            return Err(NodeError::AlreadyRunning);
        }

        let runtime = Handle::try_current().map_err(|_| crate::bus::BusError::NoRuntime)?;
        self.inner.routing.start()?;
        self.inner.agent.start()?;

        let weak: Weak<NodeInner> = Arc::downgrade(&self.inner);
        self.bus()
            .subscribe(FORWARDER, EventKind::BundleReceived, Affinity::Pool, move |event| {
                let NodeEvent::BundleReceived { eid, bundle } = event else {
                    return Ok(());
                };
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                debug!(from = %eid, bid = %bundle.bid, "Forwarding inbound bundle");
                let node = Node { inner };
                let bundle = bundle.clone();
                runtime.spawn(async move {
                    let bid = bundle.bid;
                    match node.forward(bundle).await {
                        Ok(outcome) => debug!(bid = %bid, outcome = ?outcome, "Inbound bundle forwarded"),
                        Err(e) => warn!(bid = %bid, error = %e, "Inbound bundle not forwarded"),
                    }
                });
                Ok(())
            })?;

        *running = true;
        info!(local_eid = %self.config().local_eid.get(), "Node started");
        Ok(())
    }

    /// Move `bundle` one step towards its destination
    pub async fn forward(&self, mut bundle: Bundle) -> Result<Forwarded, NodeError> {
        bundle.check_lifetime(now_ms())?;
        let destination = bundle.destination.clone();

        if self.inner.context.local.is_local(&destination) {
            self.inner.registrar.deliver(&mut bundle).await?;
            return Ok(Forwarded::Delivered);
        }

        let channel: Arc<dyn ClaChannel> = match self.inner.routing.route(&destination) {
            Some(channel) => channel,
            None => self.inner.agent.create_opportunity_for_bundle(&destination).await?,
        };
        let next_hop = channel.eid().clone();
        channel.send(bundle).await?;
        debug!(destination = %destination, next_hop = %next_hop, "Bundle sent");
        Ok(Forwarded::Sent { next_hop })
    }

    /// Release every subscription and close all channels
    pub async fn shutdown(&self) {
        self.bus().unsubscribe(FORWARDER);
        self.inner.agent.stop();
        self.inner.routing.stop();
        self.inner.manager.shutdown().await;
        *self.inner.running.write() = false;
        info!("Node shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;

    #[test]
    fn test_start_requires_runtime() {
        let node = Node::new(Arc::new(NodeConfig::default()));
        assert!(matches!(node.start(), Err(NodeError::Bus(BusError::NoRuntime))));
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let node = Node::new(Arc::new(NodeConfig::default()));
        node.start().unwrap();
        let err = tokio_test::assert_err!(node.start());
        assert!(matches!(err, NodeError::AlreadyRunning));
        node.shutdown().await;
        assert!(!node.is_running());
        assert_eq!(node.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_context_shares_config() {
        let node = Node::new(Arc::new(NodeConfig::default()));
        assert!(Arc::ptr_eq(node.config(), &node.context().config));
        assert_eq!(node.bus().workers(), 4);
    }
}
