// Link-local routing table
//
// peer channel key -> channel, maintained only by the ChannelOpened and
// ChannelClosed handlers so the table follows the CLA manager's live set.
// Entries are weak: a route never keeps a channel alive. ChannelClosed only
// removes an entry whose channel is gone or closed.
//
// The table exists only while ENABLE_LINKLOCAL_ROUTING is on. Turning it off
// unsubscribes and drops every entry.

use crate::bus::{Affinity, BusError, EventBus, EventKind, NodeEvent};
use crate::cla::ClaChannel;
use crate::config::NodeConfig;
use crate::eid::Eid;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SUBSCRIBER: &str = "linklocal-routing";

type RouteTable = HashMap<String, Weak<dyn ClaChannel>>;

struct RoutingInner {
    bus: Arc<EventBus>,
    table: RwLock<Option<RouteTable>>,
}

pub struct LinkLocalRouting {
    inner: Arc<RoutingInner>,
    config: Arc<NodeConfig>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl LinkLocalRouting {
    pub fn new(config: Arc<NodeConfig>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(RoutingInner {
                bus,
                table: RwLock::new(None),
            }),
            config,
            watcher: Mutex::new(None),
        }
    }

    /// Apply the current enable flag and follow its changes.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        let mut rx = self.config.enable_linklocal_routing.subscribe();
        let enabled = *rx.borrow_and_update();
        self.inner.apply(enabled)?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let enabled = *rx.borrow_and_update();
                if let Err(e) = inner.apply(enabled) {
                    warn!(error = %e, "Link-local routing toggle failed");
                }
            }
        });
        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop following the flag, unsubscribe and clear the table
    pub fn stop(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        // Disabling never needs a runtime
        let _ = self.inner.apply(false);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.table.read().is_some()
    }

    /// Live channel to the peer named by `eid`
    pub fn route(&self, eid: &Eid) -> Option<Arc<dyn ClaChannel>> {
        let table = self.inner.table.read();
        table
            .as_ref()?
            .get(&eid.channel_key())
            .and_then(Weak::upgrade)
            .filter(|channel| !channel.is_closed())
    }

    /// Number of entries, zero while disabled
    pub fn len(&self) -> usize {
        self.inner.table.read().as_ref().map(HashMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for LinkLocalRouting {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RoutingInner {
    fn apply(self: &Arc<Self>, enabled: bool) -> Result<(), BusError> {
        if enabled {
            if self.table.read().is_some() {
                return Ok(());
            }
            *self.table.write() = Some(HashMap::new());

            let weak = Arc::downgrade(self);
            let subscribed = self
                .bus
                .subscribe(SUBSCRIBER, EventKind::ChannelOpened, Affinity::Inline, {
                    let weak = weak.clone();
                    move |event| {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_event(event);
                        }
                        Ok(())
                    }
                })
                .and_then(|_| {
                    self.bus
                        .subscribe(SUBSCRIBER, EventKind::ChannelClosed, Affinity::Inline, move |event| {
                            if let Some(inner) = weak.upgrade() {
                                inner.on_event(event);
                            }
                            Ok(())
                        })
                });
            if let Err(e) = subscribed {
                self.bus.unsubscribe(SUBSCRIBER);
                *self.table.write() = None;
                return Err(e);
            }
            info!("Link-local routing enabled");
        } else {
            self.bus.unsubscribe(SUBSCRIBER);
            if self.table.write().take().is_some() {
                info!("Link-local routing disabled");
            }
        }
        Ok(())
    }

    fn on_event(&self, event: &NodeEvent) {
        let mut table = self.table.write();
        let Some(table) = table.as_mut() else {
            return;
        };
        match event {
            NodeEvent::ChannelOpened { eid, channel } => {
                table.insert(eid.channel_key(), Arc::downgrade(channel));
                debug!(eid = %eid, "Route added");
            }
            // A close may arrive after the peer was already reopened
            NodeEvent::ChannelClosed { eid } => {
                let key = eid.channel_key();
                let stale = table
                    .get(&key)
                    .map(|entry| entry.upgrade().map_or(true, |channel| channel.is_closed()))
                    .unwrap_or(false);
                if stale {
                    table.remove(&key);
                    debug!(eid = %eid, "Route removed");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cla::MemoryChannel;
    use crate::config::ENABLE_LINKLOCAL_ROUTING;
    use std::time::Duration;

    fn eid(raw: &str) -> Eid {
        Eid::create(raw).unwrap()
    }

    fn setup() -> (Arc<NodeConfig>, Arc<EventBus>, LinkLocalRouting) {
        let config = Arc::new(NodeConfig::default());
        let bus = Arc::new(EventBus::default());
        let routing = LinkLocalRouting::new(config.clone(), bus.clone());
        (config, bus, routing)
    }

    fn opened(bus: &EventBus, peer: &Eid) -> Arc<MemoryChannel> {
        let (channel, _remote) = MemoryChannel::pair(peer.clone(), eid("cla:mem:self:0"));
        bus.publish(NodeEvent::ChannelOpened {
            eid: peer.clone(),
            channel: channel.clone(),
        });
        channel
    }

    #[tokio::test]
    async fn test_close_of_unknown_peer_is_noop() {
        let (_config, bus, routing) = setup();
        routing.start().unwrap();
        let peer = eid("cla:mem:a:1");
        let _channel = opened(&bus, &peer);

        bus.publish(NodeEvent::ChannelClosed {
            eid: eid("cla:mem:never:1"),
        });
        assert!(routing.route(&peer).is_some());
        assert_eq!(routing.len(), 1);
    }

    #[tokio::test]
    async fn test_late_close_keeps_reopened_route() {
        let (_config, bus, routing) = setup();
        routing.start().unwrap();
        let peer = eid("cla:mem:a:1");
        let first = opened(&bus, &peer);
        first.close();
        let second = opened(&bus, &peer);

        bus.publish(NodeEvent::ChannelClosed { eid: peer.clone() });
        let routed = routing.route(&peer).expect("route to the reopened channel");
        let expected: Arc<dyn ClaChannel> = second;
        assert!(Arc::ptr_eq(&routed, &expected));
    }

    #[tokio::test]
    async fn test_route_ignores_sink() {
        let (_config, bus, routing) = setup();
        routing.start().unwrap();
        let _channel = opened(&bus, &eid("cla:mem:a:1"));
        assert!(routing.route(&eid("cla:mem:a:1/app/")).is_some());
    }

    #[tokio::test]
    async fn test_dropped_channel_has_no_route() {
        let (_config, bus, routing) = setup();
        routing.start().unwrap();
        let peer = eid("cla:mem:a:1");
        let channel = opened(&bus, &peer);
        drop(channel);
        assert!(routing.route(&peer).is_none());
    }

    #[tokio::test]
    async fn test_toggle_clears_and_unsubscribes() {
        let (config, bus, routing) = setup();
        routing.start().unwrap();
        assert!(routing.is_enabled());
        assert!(bus.is_subscribed(SUBSCRIBER));
        let peer = eid("cla:mem:a:1");
        let _channel = opened(&bus, &peer);

        config.set(ENABLE_LINKLOCAL_ROUTING, "false").unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while routing.is_enabled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("routing not disabled");
        assert!(!bus.is_subscribed(SUBSCRIBER));
        assert!(routing.route(&peer).is_none());

        let _ignored = opened(&bus, &peer);
        assert_eq!(routing.len(), 0);

        config.set(ENABLE_LINKLOCAL_ROUTING, "true").unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !routing.is_enabled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("routing not re-enabled");
        assert!(routing.is_empty(), "re-enabled table starts empty");
    }

    #[tokio::test]
    async fn test_start_disabled() {
        let (config, bus, routing) = setup();
        config.set(ENABLE_LINKLOCAL_ROUTING, "false").unwrap();
        routing.start().unwrap();
        assert!(!routing.is_enabled());
        let peer = eid("cla:mem:a:1");
        let _channel = opened(&bus, &peer);
        assert!(routing.route(&peer).is_none());
    }

    #[tokio::test]
    async fn test_stop_releases_subscription() {
        let (_config, bus, routing) = setup();
        routing.start().unwrap();
        routing.stop();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
