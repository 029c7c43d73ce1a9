// Events exchanged between node components

use crate::bundle::{Bundle, BundleId};
use crate::cla::ClaChannel;
use crate::eid::Eid;
use std::fmt;
use std::sync::Arc;

/// Kind tag of a [`NodeEvent`], the key subscriptions are made on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChannelOpened,
    ChannelClosed,
    PeerReachable,
    PeerUnreachable,
    BundleReceived,
    BundleIndexed,
    BundleDeleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immutable notification of a state change
#[derive(Clone)]
pub enum NodeEvent {
    /// A channel to `eid` was registered by the CLA manager
    ChannelOpened {
        eid: Eid,
        channel: Arc<dyn ClaChannel>,
    },
    /// The channel to `eid` is gone
    ChannelClosed { eid: Eid },
    /// A discovery source saw a peer at `address`
    PeerReachable { address: String },
    PeerUnreachable,
    /// A bundle arrived on the channel to `eid`
    BundleReceived { eid: Eid, bundle: Bundle },
    /// Storage indexed a bundle
    BundleIndexed { bundle: Bundle },
    /// Storage deleted a bundle
    BundleDeleted { bid: BundleId },
}

impl NodeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NodeEvent::ChannelOpened { .. } => EventKind::ChannelOpened,
            NodeEvent::ChannelClosed { .. } => EventKind::ChannelClosed,
            NodeEvent::PeerReachable { .. } => EventKind::PeerReachable,
            NodeEvent::PeerUnreachable => EventKind::PeerUnreachable,
            NodeEvent::BundleReceived { .. } => EventKind::BundleReceived,
            NodeEvent::BundleIndexed { .. } => EventKind::BundleIndexed,
            NodeEvent::BundleDeleted { .. } => EventKind::BundleDeleted,
        }
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::ChannelOpened { eid, channel } => {
                write!(f, "ChannelOpened {{ eid: {}, state: {} }}", eid, channel.state())
            }
            NodeEvent::ChannelClosed { eid } => write!(f, "ChannelClosed {{ eid: {} }}", eid),
            NodeEvent::PeerReachable { address } => {
                write!(f, "PeerReachable {{ address: {} }}", address)
            }
            NodeEvent::PeerUnreachable => write!(f, "PeerUnreachable"),
            NodeEvent::BundleReceived { eid, bundle } => {
                write!(f, "BundleReceived {{ eid: {}, bid: {} }}", eid, bundle.bid)
            }
            NodeEvent::BundleIndexed { bundle } => {
                write!(f, "BundleIndexed {{ bid: {} }}", bundle.bid)
            }
            NodeEvent::BundleDeleted { bid } => write!(f, "BundleDeleted {{ bid: {} }}", bid),
        }
    }
}

impl fmt::Debug for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
