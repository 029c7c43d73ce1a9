//! Convergence-layer contract
//!
//! A convergence layer adapter (CLA) bridges the node to one link technology.
//! Every adapter is driven through [`ConvergenceLayer`] and hands out
//! [`ClaChannel`]s, one per live association with a remote peer. The
//! [`ClaManager`] owns channels once they exist.

pub mod channel;
pub mod manager;
pub mod memory;

use crate::bundle::Bundle;
use crate::eid::Eid;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use channel::ChannelCore;
pub use manager::ClaManager;
pub use memory::{MemoryChannel, MemoryCla};

/// Errors from convergence layers and the channel manager.
///
/// `Clone` so a single open attempt can report the same failure to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaError {
    #[error("No convergence layer registered for: {0}")]
    UnknownTransport(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Open attempt cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Lifecycle of a channel. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Opening,
    Active,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Opening => write!(f, "Opening"),
            ChannelState::Active => write!(f, "Active"),
            ChannelState::Closed => write!(f, "Closed"),
        }
    }
}

/// Stream of bundles received on a channel; an error ends the stream
pub type BundleStream = BoxStream<'static, Result<Bundle, ClaError>>;

/// Stream of channels produced by a running convergence layer
pub type ChannelStream = BoxStream<'static, Arc<dyn ClaChannel>>;

/// One bidirectional association with exactly one remote peer
#[async_trait]
pub trait ClaChannel: Send + Sync {
    /// EID of the remote peer, unique among open channels
    fn eid(&self) -> &Eid;

    fn state(&self) -> ChannelState;

    fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Bundles received from the peer.
    ///
    /// Nothing is read until the stream is polled. Calling this again after a
    /// previous stream ended resumes reception where it stopped.
    fn recv_bundles(&self) -> BundleStream;

    /// Send one bundle; resolves once the transport accepted it
    async fn send(&self, bundle: Bundle) -> Result<(), ClaError>;

    /// Send bundles in order, stopping at the first failure.
    ///
    /// Returns how many bundles were accepted.
    async fn send_all(&self, bundles: Vec<Bundle>) -> Result<usize, ClaError> {
        let mut sent = 0;
        for bundle in bundles {
            self.send(bundle).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Terminate both directions. Idempotent; the channel cannot reopen.
    fn close(&self);

    /// Resolves once the channel is closed, from either side
    async fn closed(&self);
}

/// A pluggable transport
#[async_trait]
pub trait ConvergenceLayer: Send + Sync {
    /// Unique name, matched against the `cla:<name>:` part of peer EIDs
    fn name(&self) -> &str;

    /// Begin producing channels: accepted inbound connections and any the
    /// transport establishes on its own. The stream ends after `stop`.
    async fn start(&self) -> Result<ChannelStream, ClaError>;

    /// Stop producing new channels. What happens to channels already handed
    /// out is defined by each transport.
    async fn stop(&self);

    /// One proactive connection attempt to `peer`
    async fn open(&self, peer: &Eid) -> Result<Arc<dyn ClaChannel>, ClaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_display() {
        assert_eq!(ChannelState::Opening.to_string(), "Opening");
        assert_eq!(ChannelState::Active.to_string(), "Active");
        assert_eq!(ChannelState::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_cla_error_clone() {
        let err1 = ClaError::Connection("refused".to_string());
        let err2 = err1.clone();
        assert_eq!(err1, err2);
        assert!(err1.to_string().contains("refused"));
    }
}
