// Bundle — the unit of data this node stores and forwards
//
// Only the fields the forwarding engine needs are modelled here; the wire
// encoding of primary and extension blocks belongs to the codec.

use crate::eid::Eid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Unique bundle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleId(pub Uuid);

impl BundleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BundleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The bundle's lifetime has passed
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Bundle {bid} expired")]
pub struct BundleExpired {
    pub bid: BundleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub bid: BundleId,
    pub source: Eid,
    pub destination: Eid,
    /// Creation time, milliseconds since the unix epoch
    pub creation_timestamp_ms: u64,
    /// Lifetime in milliseconds; 0 never expires
    pub lifetime_ms: u64,
    pub payload: Vec<u8>,
}

impl Bundle {
    /// New bundle created now with the given lifetime
    pub fn new(source: Eid, destination: Eid, lifetime_ms: u64, payload: Vec<u8>) -> Self {
        Self {
            bid: BundleId::new(),
            source,
            destination,
            creation_timestamp_ms: now_ms(),
            lifetime_ms,
            payload,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.lifetime_ms != 0
            && now_ms > self.creation_timestamp_ms.saturating_add(self.lifetime_ms)
    }

    /// Lifetime check used before delivery or forwarding
    pub fn check_lifetime(&self, now_ms: u64) -> Result<(), BundleExpired> {
        if self.is_expired(now_ms) {
            Err(BundleExpired { bid: self.bid })
        } else {
            Ok(())
        }
    }

    /// Drop the payload once it has been consumed
    pub fn clear_payload(&mut self) {
        self.payload.clear();
        self.payload.shrink_to_fit();
    }
}

/// Current time in milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(lifetime_ms: u64) -> Bundle {
        Bundle::new(
            Eid::create("dtn://src/").unwrap(),
            Eid::create("dtn://dst/app/").unwrap(),
            lifetime_ms,
            b"hello".to_vec(),
        )
    }

    #[test]
    fn test_lifetime_check() {
        let b = bundle(1_000);
        let created = b.creation_timestamp_ms;
        assert!(b.check_lifetime(created + 1_000).is_ok());
        assert_eq!(
            b.check_lifetime(created + 1_001),
            Err(BundleExpired { bid: b.bid })
        );
    }

    #[test]
    fn test_zero_lifetime_never_expires() {
        let b = bundle(0);
        assert!(!b.is_expired(u64::MAX));
    }

    #[test]
    fn test_clear_payload() {
        let mut b = bundle(1_000);
        b.clear_payload();
        assert!(b.payload.is_empty());
    }

    #[test]
    fn test_bundle_ids_unique() {
        assert_ne!(BundleId::new(), BundleId::new());
    }
}
