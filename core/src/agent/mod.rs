//! Connection Agent
//!
//! Decides when the CLA manager should open a channel. Every request is a
//! single attempt; retry policy lives with the caller. Concurrent requests
//! for one peer collapse in the manager, so the agent keeps no in-flight state.
//!
//! While `COMPONENT_ENABLE_CONNECTION_AGENT` is on the agent also reacts to
//! discovery events: each `PeerReachable` becomes a detect-driven open.

use crate::bus::{Affinity, BusError, EventBus, EventKind, NodeEvent};
use crate::cla::{ClaChannel, ClaError, ClaManager};
use crate::config::{
    NodeConfig, COMPONENT_ENABLE_CONNECTION_AGENT, ENABLE_AUTO_CONNECT_FOR_BUNDLE,
    ENABLE_AUTO_CONNECT_FOR_DETECT_EVENT,
};
use crate::eid::{Eid, EidError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SUBSCRIBER: &str = "connection-agent";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Feature disabled: {0}")]
    FeatureDisabled(&'static str),
    #[error("Component disabled: {0}")]
    ComponentDisabled(&'static str),
    #[error("Invalid peer address: {0}")]
    InvalidAddress(#[from] EidError),
    #[error(transparent)]
    Cla(#[from] ClaError),
}

struct AgentInner {
    config: Arc<NodeConfig>,
    bus: Arc<EventBus>,
    manager: ClaManager,
}

pub struct ConnectionAgent {
    inner: Arc<AgentInner>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionAgent {
    pub fn new(config: Arc<NodeConfig>, bus: Arc<EventBus>, manager: ClaManager) -> Self {
        Self {
            inner: Arc::new(AgentInner { config, bus, manager }),
            watcher: Mutex::new(None),
        }
    }

    /// Open a channel to a freshly detected host.
    ///
    /// The peer EID is built from `CLA_NAME_FOR_DETECT` and
    /// `DETECT_DEFAULT_PORT`. Fails with `FeatureDisabled` without touching
    /// the manager when detect-driven connections are off.
    pub async fn create_opportunity_lib_detect(&self, host: &str) -> Result<Arc<dyn ClaChannel>, AgentError> {
        self.inner.create_opportunity_lib_detect(host).await
    }

    /// Open a channel towards a bundle's next hop.
    ///
    /// Gated by the component flag, then by `ENABLE_AUTO_CONNECT_FOR_BUNDLE`.
    pub async fn create_opportunity_for_bundle(&self, eid: &Eid) -> Result<Arc<dyn ClaChannel>, AgentError> {
        let config = &self.inner.config;
        if !config.component_enable_connection_agent.get() {
            return Err(AgentError::ComponentDisabled(COMPONENT_ENABLE_CONNECTION_AGENT));
        }
        if !config.enable_auto_connect_for_bundle.get() {
            return Err(AgentError::FeatureDisabled(ENABLE_AUTO_CONNECT_FOR_BUNDLE));
        }

        match self.inner.manager.open_channel(eid).await {
            Ok(channel) => {
                info!(peer = %eid, "Opened channel for bundle");
                Ok(channel)
            }
            Err(e) => {
                warn!(peer = %eid, error = %e, "Bundle-driven connection failed");
                Err(e.into())
            }
        }
    }

    /// Follow `COMPONENT_ENABLE_CONNECTION_AGENT`, subscribing to discovery
    /// events while it is on.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        let runtime = Handle::try_current().map_err(|_| BusError::NoRuntime)?;
        let mut rx = self.inner.config.component_enable_connection_agent.subscribe();
        let enabled = *rx.borrow_and_update();
        self.inner.apply(enabled, &runtime)?;

        let inner = self.inner.clone();
        let handle = runtime.spawn({
            let runtime = runtime.clone();
            async move {
                while rx.changed().await.is_ok() {
                    let enabled = *rx.borrow_and_update();
                    if let Err(e) = inner.apply(enabled, &runtime) {
                        warn!(error = %e, "Connection agent toggle failed");
                    }
                }
            }
        });
        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.inner.bus.unsubscribe(SUBSCRIBER);
    }

    /// Whether discovery events are currently being followed
    pub fn is_listening(&self) -> bool {
        self.inner.bus.is_subscribed(SUBSCRIBER)
    }
}

impl Drop for ConnectionAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AgentInner {
    async fn create_opportunity_lib_detect(&self, host: &str) -> Result<Arc<dyn ClaChannel>, AgentError> {
        if !self.config.enable_auto_connect_for_detect_event.get() {
            return Err(AgentError::FeatureDisabled(ENABLE_AUTO_CONNECT_FOR_DETECT_EVENT));
        }

        let eid = detect_eid(
            &self.config.cla_name_for_detect.get(),
            host,
            self.config.detect_default_port.get(),
        )?;
        match self.manager.open_channel(&eid).await {
            Ok(channel) => {
                info!(peer = %eid, "Opened channel to detected peer");
                Ok(channel)
            }
            Err(e) => {
                warn!(peer = %eid, error = %e, "Detect-driven connection failed");
                Err(e.into())
            }
        }
    }

    fn apply(self: &Arc<Self>, enabled: bool, runtime: &Handle) -> Result<(), BusError> {
        if !enabled {
            if self.bus.unsubscribe(SUBSCRIBER) {
                info!("Connection agent stopped listening for peers");
            }
            return Ok(());
        }
        if self.bus.is_subscribed(SUBSCRIBER) {
            return Ok(());
        }

        let weak: Weak<AgentInner> = Arc::downgrade(self);
        let runtime = runtime.clone();
        self.bus
            .subscribe(SUBSCRIBER, EventKind::PeerReachable, Affinity::Pool, move |event| {
                let NodeEvent::PeerReachable { address } = event else {
                    return Ok(());
                };
                let Some(agent) = weak.upgrade() else {
                    return Ok(());
                };
                let address = address.clone();
                runtime.spawn(async move {
                    // Failures are logged inside; nothing to escalate
                    let _ = agent.create_opportunity_lib_detect(&address).await;
                });
                Ok(())
            })?;
        info!("Connection agent listening for peers");
        Ok(())
    }
}

/// Transport EID for a bare detected host
fn detect_eid(cla_name: &str, host: &str, port: u16) -> Result<Eid, EidError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(EidError::Malformed {
            scheme: "cla".to_string(),
            reason: "empty detected host".to_string(),
        });
    }
    let locator = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    Eid::create(&format!("cla:{}:{}", cla_name, locator))
}
