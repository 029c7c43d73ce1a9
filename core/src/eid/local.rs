//! Local address detection
//!
//! Reads `LOCAL_EID` and `ALIASES` on every call so alias changes apply
//! immediately.

use super::{normalize_path, Eid};
use crate::config::NodeConfig;
use std::sync::Arc;

/// Prefix of the node-local application namespace, always local
pub const API_ME_PREFIX: &str = "api:me";

#[derive(Debug, Clone)]
pub struct LocalAddresses {
    config: Arc<NodeConfig>,
}

impl LocalAddresses {
    pub fn new(config: Arc<NodeConfig>) -> Self {
        Self { config }
    }

    /// Whether `eid` addresses this node
    pub fn is_local(&self, eid: &Eid) -> bool {
        self.matching_prefix(&eid.to_string()).is_some()
    }

    /// Registrar path for a locally destined EID, `None` if not local.
    ///
    /// The matching local prefix is stripped and the rest normalized to
    /// start with `/`, so `dtn://node/null/` on node `dtn://node/` and
    /// `api:me/null/` both give `/null/`.
    pub fn local_sink(&self, eid: &Eid) -> Option<String> {
        let raw = eid.to_string();
        let prefix = self.matching_prefix(&raw)?;
        let rest = &raw[prefix.len()..];
        let sink = normalize_path(rest);
        if sink.is_empty() {
            Some("/".to_string())
        } else {
            Some(sink)
        }
    }

    /// Longest local prefix of `raw`
    fn matching_prefix(&self, raw: &str) -> Option<String> {
        let mut candidates = vec![API_ME_PREFIX.to_string(), self.config.local_eid.get().to_string()];
        candidates.extend(self.config.aliases.get().iter().map(|a| a.to_string()));

        candidates
            .into_iter()
            .map(|c| c.trim_end_matches('/').to_string())
            .filter(|c| !c.is_empty() && has_eid_prefix(raw, c))
            .max_by_key(|c| c.len())
    }
}

/// `raw` starts with `prefix` and the match ends on a path boundary
fn has_eid_prefix(raw: &str, prefix: &str) -> bool {
    match raw.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ALIASES, LOCAL_EID};

    fn eid(raw: &str) -> Eid {
        Eid::create(raw).unwrap()
    }

    fn addresses() -> (Arc<NodeConfig>, LocalAddresses) {
        let config = Arc::new(NodeConfig::default());
        config.set(LOCAL_EID, "dtn://node1/").unwrap();
        let local = LocalAddresses::new(config.clone());
        (config, local)
    }

    #[test]
    fn test_local_eid_prefix() {
        let (_config, local) = addresses();
        assert!(local.is_local(&eid("dtn://node1/")));
        assert!(local.is_local(&eid("dtn://node1/null/")));
        assert!(!local.is_local(&eid("dtn://node2/null/")));
        assert!(!local.is_local(&eid("dtn://node10/null/")));
    }

    #[test]
    fn test_api_me_always_local() {
        let (_config, local) = addresses();
        assert!(local.is_local(&eid("api:me/inbox/")));
        assert_eq!(local.local_sink(&eid("api:me/inbox/")).as_deref(), Some("/inbox/"));
    }

    #[test]
    fn test_alias_observed_live() {
        let (config, local) = addresses();
        let target = eid("ipn:7.3");
        assert!(!local.is_local(&target));

        config.set(ALIASES, "ipn:7.3").unwrap();
        assert!(local.is_local(&target));
        assert!(!local.is_local(&eid("ipn:7.30")));

        config.set(ALIASES, "").unwrap();
        assert!(!local.is_local(&target));
    }

    #[test]
    fn test_local_sink_strips_prefix() {
        let (_config, local) = addresses();
        assert_eq!(local.local_sink(&eid("dtn://node1/null/")).as_deref(), Some("/null/"));
        assert_eq!(local.local_sink(&eid("dtn://node1/")).as_deref(), Some("/"));
        assert_eq!(local.local_sink(&eid("dtn://other/null/")), None);
    }
}
