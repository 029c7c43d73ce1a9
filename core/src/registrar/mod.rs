//! Registrar
//!
//! Table of local application sinks and last-mile delivery. A sink path is
//! slash delimited and stored in canonical form with a leading and trailing
//! `/` (`null` and `/null` both name `/null/`).
//!
//! The built-in null sink answers at `/null/` whenever no application has
//! bound that path: it discards the payload and reports success.

use crate::bundle::{now_ms, Bundle, BundleExpired};
use crate::config::{NodeConfig, COMPONENT_ENABLE_REGISTRAR};
use crate::eid::local::LocalAddresses;
use crate::eid::Eid;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Path of the built-in discard sink
pub const NULL_SINK: &str = "/null/";

/// Failure reported by a sink handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink rejected bundle: {0}")]
    Rejected(String),
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Application endpoint receiving bundles for one sink path.
///
/// The handler owns the bundle contents once it returns `Ok`; clearing the
/// payload marks it consumed.
#[async_trait]
pub trait SinkHandler: Send + Sync {
    async fn deliver(&self, bundle: &mut Bundle) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistrarError {
    #[error("Registrar is disabled ({})", COMPONENT_ENABLE_REGISTRAR)]
    RegistrarDisabled,
    #[error("Missing argument: {0}")]
    NullArgument(&'static str),
    #[error("Sink already registered: {0}")]
    SinkAlreadyRegistered(String),
    #[error("No such sink: {0}")]
    NoSuchSink(String),
    #[error("Destination is not local: {0}")]
    NotLocal(Eid),
    #[error(transparent)]
    BundleExpired(#[from] BundleExpired),
    #[error("Delivery to {sink} failed: {source}")]
    Delivery { sink: String, source: SinkError },
}

/// Discards every bundle it receives
pub struct NullSink;

#[async_trait]
impl SinkHandler for NullSink {
    async fn deliver(&self, bundle: &mut Bundle) -> Result<(), SinkError> {
        debug!(bid = %bundle.bid, "Bundle discarded by null sink");
        bundle.clear_payload();
        Ok(())
    }
}

pub struct Registrar {
    config: Arc<NodeConfig>,
    local: LocalAddresses,
    sinks: RwLock<HashMap<String, Arc<dyn SinkHandler>>>,
    null_sink: Arc<NullSink>,
}

impl Registrar {
    pub fn new(config: Arc<NodeConfig>, local: LocalAddresses) -> Self {
        Self {
            config,
            local,
            sinks: RwLock::new(HashMap::new()),
            null_sink: Arc::new(NullSink),
        }
    }

    fn is_enabled(&self) -> bool {
        self.config.component_enable_registrar.get()
    }

    /// Bind `handler` to `path`; visible to the next delivery.
    pub fn register(&self, path: &str, handler: Arc<dyn SinkHandler>) -> Result<(), RegistrarError> {
        if !self.is_enabled() {
            return Err(RegistrarError::RegistrarDisabled);
        }
        let path = canonical_path(path).ok_or(RegistrarError::NullArgument("path"))?;

        let mut sinks = self.sinks.write();
        if sinks.contains_key(&path) {
            return Err(RegistrarError::SinkAlreadyRegistered(path));
        }
        sinks.insert(path.clone(), handler);
        info!(sink = %path, "Sink registered");
        Ok(())
    }

    /// Remove the binding at `path`; false if there was none
    pub fn unregister(&self, path: &str) -> bool {
        let Some(path) = canonical_path(path) else {
            return false;
        };
        let removed = self.sinks.write().remove(&path).is_some();
        if removed {
            info!(sink = %path, "Sink unregistered");
        }
        removed
    }

    /// Whether an application handler is bound at `path`
    pub fn is_registered(&self, path: &str) -> bool {
        canonical_path(path)
            .map(|path| self.sinks.read().contains_key(&path))
            .unwrap_or(false)
    }

    /// Registered paths, sorted
    pub fn sinks(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.sinks.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Sink path a bundle for `destination` would be delivered to
    pub fn resolve(&self, destination: &Eid) -> Result<String, RegistrarError> {
        let sink = self
            .local
            .local_sink(destination)
            .ok_or_else(|| RegistrarError::NotLocal(destination.clone()))?;
        canonical_path(&sink).ok_or_else(|| RegistrarError::NoSuchSink(sink))
    }

    /// Hand `bundle` to the sink bound at its destination path.
    ///
    /// The handler's own failure is returned once, never retried. On any
    /// error before the handler runs the bundle is left untouched.
    pub async fn deliver(&self, bundle: &mut Bundle) -> Result<(), RegistrarError> {
        if !self.is_enabled() {
            return Err(RegistrarError::RegistrarDisabled);
        }
        bundle.check_lifetime(now_ms())?;

        let path = self.resolve(&bundle.destination)?;
        let handler = self.handler_for(&path).ok_or_else(|| RegistrarError::NoSuchSink(path.clone()))?;

        debug!(bid = %bundle.bid, sink = %path, "Delivering bundle");
        handler.deliver(bundle).await.map_err(|source| {
            warn!(bid = %bundle.bid, sink = %path, error = %source, "Sink failed");
            RegistrarError::Delivery { sink: path, source }
        })
    }

    fn handler_for(&self, path: &str) -> Option<Arc<dyn SinkHandler>> {
        if let Some(handler) = self.sinks.read().get(path) {
            return Some(handler.clone());
        }
        (path == NULL_SINK).then(|| self.null_sink.clone() as Arc<dyn SinkHandler>)
    }
}

/// `a/b` -> `/a/b/`; `None` for a blank path
pub fn canonical_path(path: &str) -> Option<String> {
    let trimmed = path.trim().trim_matches('/');
    if path.trim().is_empty() {
        return None;
    }
    if trimmed.is_empty() {
        return Some("/".to_string());
    }
    Some(format!("/{}/", trimmed))
}
