// dtnode core — delay-tolerant networking node engine
//
// Connection lifecycle (CLA manager, connection agent), link-local routing,
// local sink delivery (registrar) and the event bus that ties them together.
// Bundle wire codecs, storage and discovery live outside this crate and talk
// to it through the bus and the traits exported here.

pub mod aa;
pub mod agent;
pub mod bundle;
pub mod bus;
pub mod cla;
pub mod config;
pub mod eid;
pub mod logging;
pub mod node;
pub mod registrar;
pub mod routing;

use thiserror::Error;

pub use agent::{AgentError, ConnectionAgent};
pub use bundle::{Bundle, BundleExpired, BundleId};
pub use bus::{Affinity, BusError, EventBus, EventKind, NodeEvent};
pub use cla::{ClaChannel, ClaError, ClaManager, ConvergenceLayer, MemoryCla};
pub use config::{ConfigError, NodeConfig, Settings};
pub use eid::{Eid, EidError};
pub use node::{Forwarded, Node, NodeContext};
pub use registrar::{Registrar, RegistrarError, SinkError, SinkHandler};
pub use routing::LinkLocalRouting;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    #[error("Already running")]
    AlreadyRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Eid(#[from] EidError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Cla(#[from] ClaError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Registrar(#[from] RegistrarError),
    #[error(transparent)]
    BundleExpired(#[from] BundleExpired),
}
