//! Node configuration
//!
//! Every setting is a named [`ConfigEntry`] backed by a `tokio::sync::watch`
//! channel. Components that react to toggles subscribe to the entry instead
//! of reading it once at startup, so a change applies to the next decision
//! without restarting anything.
//!
//! [`Settings`] is the serialized image of the entries, stored as JSON.

use crate::eid::{Eid, EidError};
use crate::logging::LogLevel;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::sync::watch;

pub const COMPONENT_ENABLE_CONNECTION_AGENT: &str = "COMPONENT_ENABLE_CONNECTION_AGENT";
pub const COMPONENT_ENABLE_REGISTRAR: &str = "COMPONENT_ENABLE_REGISTRAR";
pub const COMPONENT_ENABLE_LOGGING: &str = "COMPONENT_ENABLE_LOGGING";
pub const ENABLE_AUTO_CONNECT_FOR_DETECT_EVENT: &str = "ENABLE_AUTO_CONNECT_FOR_DETECT_EVENT";
pub const ENABLE_AUTO_CONNECT_FOR_BUNDLE: &str = "ENABLE_AUTO_CONNECT_FOR_BUNDLE";
pub const ENABLE_LINKLOCAL_ROUTING: &str = "ENABLE_LINKLOCAL_ROUTING";
pub const LOCAL_EID: &str = "LOCAL_EID";
pub const ALIASES: &str = "ALIASES";
pub const LOG_LEVEL: &str = "LOG_LEVEL";
pub const CLA_NAME_FOR_DETECT: &str = "CLA_NAME_FOR_DETECT";
pub const DETECT_DEFAULT_PORT: &str = "DETECT_DEFAULT_PORT";
pub const EVENT_POOL_WORKERS: &str = "EVENT_POOL_WORKERS";

/// Default port of the TCP convergence layer
pub const DEFAULT_STCP_PORT: u16 = 4556;

/// Errors from reading or writing configuration entries
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown config key: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid EID in configuration: {0}")]
    InvalidEid(#[from] EidError),
}

/// A named, observable setting
pub struct ConfigEntry<T> {
    key: &'static str,
    tx: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> ConfigEntry<T> {
    pub fn new(key: &'static str, value: T) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { key, tx }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Current value
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and wake every observer
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Receiver that observes every subsequent change
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ConfigEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEntry")
            .field("key", &self.key)
            .field("value", &*self.tx.borrow())
            .finish()
    }
}

/// Serialized form of the node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub local_eid: String,
    pub aliases: Vec<String>,
    pub component_enable_connection_agent: bool,
    pub component_enable_registrar: bool,
    pub component_enable_logging: bool,
    pub enable_auto_connect_for_detect_event: bool,
    pub enable_auto_connect_for_bundle: bool,
    pub enable_linklocal_routing: bool,
    pub log_level: LogLevel,
    pub cla_name_for_detect: String,
    pub detect_default_port: u16,
    pub event_pool_workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_eid: "dtn://dtnode/".to_string(),
            aliases: Vec::new(),
            component_enable_connection_agent: true,
            component_enable_registrar: true,
            component_enable_logging: true,
            enable_auto_connect_for_detect_event: true,
            enable_auto_connect_for_bundle: true,
            enable_linklocal_routing: true,
            log_level: LogLevel::Info,
            cla_name_for_detect: crate::eid::STCP_CLA_NAME.to_string(),
            detect_default_port: DEFAULT_STCP_PORT,
            event_pool_workers: 4,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, or write and return defaults if missing
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("Failed to read settings file")?;
            let settings: Settings =
                serde_json::from_str(&contents).context("Failed to parse settings file")?;
            Ok(settings)
        } else {
            let settings = Settings::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    /// Save settings as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, contents).context("Failed to write settings file")?;
        Ok(())
    }
}

/// Live configuration of one node
#[derive(Debug)]
pub struct NodeConfig {
    pub local_eid: ConfigEntry<Eid>,
    pub aliases: ConfigEntry<Vec<Eid>>,
    pub component_enable_connection_agent: ConfigEntry<bool>,
    pub component_enable_registrar: ConfigEntry<bool>,
    pub component_enable_logging: ConfigEntry<bool>,
    pub enable_auto_connect_for_detect_event: ConfigEntry<bool>,
    pub enable_auto_connect_for_bundle: ConfigEntry<bool>,
    pub enable_linklocal_routing: ConfigEntry<bool>,
    pub log_level: ConfigEntry<LogLevel>,
    pub cla_name_for_detect: ConfigEntry<String>,
    pub detect_default_port: ConfigEntry<u16>,
    /// Read once when the event bus is built
    pub event_pool_workers: ConfigEntry<usize>,
}

impl NodeConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let local_eid = Eid::create(&settings.local_eid)?;
        let aliases = settings
            .aliases
            .iter()
            .map(|a| Eid::create(a))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            local_eid: ConfigEntry::new(LOCAL_EID, local_eid),
            aliases: ConfigEntry::new(ALIASES, aliases),
            component_enable_connection_agent: ConfigEntry::new(
                COMPONENT_ENABLE_CONNECTION_AGENT,
                settings.component_enable_connection_agent,
            ),
            component_enable_registrar: ConfigEntry::new(
                COMPONENT_ENABLE_REGISTRAR,
                settings.component_enable_registrar,
            ),
            component_enable_logging: ConfigEntry::new(
                COMPONENT_ENABLE_LOGGING,
                settings.component_enable_logging,
            ),
            enable_auto_connect_for_detect_event: ConfigEntry::new(
                ENABLE_AUTO_CONNECT_FOR_DETECT_EVENT,
                settings.enable_auto_connect_for_detect_event,
            ),
            enable_auto_connect_for_bundle: ConfigEntry::new(
                ENABLE_AUTO_CONNECT_FOR_BUNDLE,
                settings.enable_auto_connect_for_bundle,
            ),
            enable_linklocal_routing: ConfigEntry::new(
                ENABLE_LINKLOCAL_ROUTING,
                settings.enable_linklocal_routing,
            ),
            log_level: ConfigEntry::new(LOG_LEVEL, settings.log_level),
            cla_name_for_detect: ConfigEntry::new(
                CLA_NAME_FOR_DETECT,
                settings.cla_name_for_detect.clone(),
            ),
            detect_default_port: ConfigEntry::new(
                DETECT_DEFAULT_PORT,
                settings.detect_default_port,
            ),
            event_pool_workers: ConfigEntry::new(
                EVENT_POOL_WORKERS,
                settings.event_pool_workers.max(1),
            ),
        })
    }

    /// Snapshot of the current values
    pub fn to_settings(&self) -> Settings {
        Settings {
            local_eid: self.local_eid.get().to_string(),
            aliases: self.aliases.get().iter().map(|a| a.to_string()).collect(),
            component_enable_connection_agent: self.component_enable_connection_agent.get(),
            component_enable_registrar: self.component_enable_registrar.get(),
            component_enable_logging: self.component_enable_logging.get(),
            enable_auto_connect_for_detect_event: self.enable_auto_connect_for_detect_event.get(),
            enable_auto_connect_for_bundle: self.enable_auto_connect_for_bundle.get(),
            enable_linklocal_routing: self.enable_linklocal_routing.get(),
            log_level: self.log_level.get(),
            cla_name_for_detect: self.cla_name_for_detect.get(),
            detect_default_port: self.detect_default_port.get(),
            event_pool_workers: self.event_pool_workers.get(),
        }
    }

    /// All entry names, in display order
    pub fn keys() -> &'static [&'static str] {
        &[
            LOCAL_EID,
            ALIASES,
            COMPONENT_ENABLE_CONNECTION_AGENT,
            COMPONENT_ENABLE_REGISTRAR,
            COMPONENT_ENABLE_LOGGING,
            ENABLE_AUTO_CONNECT_FOR_DETECT_EVENT,
            ENABLE_AUTO_CONNECT_FOR_BUNDLE,
            ENABLE_LINKLOCAL_ROUTING,
            LOG_LEVEL,
            CLA_NAME_FOR_DETECT,
            DETECT_DEFAULT_PORT,
            EVENT_POOL_WORKERS,
        ]
    }

    /// Set an entry from its string form.
    ///
    /// `ALIASES` takes a comma-separated list; an empty string clears it.
    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let parse_bool = || value.trim().parse::<bool>().map_err(|_| invalid());

        match key {
            LOCAL_EID => self.local_eid.set(Eid::create(value)?),
            ALIASES => {
                let aliases = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Eid::create)
                    .collect::<Result<Vec<_>, _>>()?;
                self.aliases.set(aliases);
            }
            COMPONENT_ENABLE_CONNECTION_AGENT => {
                self.component_enable_connection_agent.set(parse_bool()?)
            }
            COMPONENT_ENABLE_REGISTRAR => self.component_enable_registrar.set(parse_bool()?),
            COMPONENT_ENABLE_LOGGING => self.component_enable_logging.set(parse_bool()?),
            ENABLE_AUTO_CONNECT_FOR_DETECT_EVENT => {
                self.enable_auto_connect_for_detect_event.set(parse_bool()?)
            }
            ENABLE_AUTO_CONNECT_FOR_BUNDLE => {
                self.enable_auto_connect_for_bundle.set(parse_bool()?)
            }
            ENABLE_LINKLOCAL_ROUTING => self.enable_linklocal_routing.set(parse_bool()?),
            LOG_LEVEL => self
                .log_level
                .set(value.parse().map_err(|_| invalid())?),
            CLA_NAME_FOR_DETECT => {
                if value.trim().is_empty() {
                    return Err(invalid());
                }
                self.cla_name_for_detect.set(value.trim().to_string())
            }
            DETECT_DEFAULT_PORT => self
                .detect_default_port
                .set(value.trim().parse().map_err(|_| invalid())?),
            EVENT_POOL_WORKERS => {
                let workers: usize = value.trim().parse().map_err(|_| invalid())?;
                if workers == 0 {
                    return Err(invalid());
                }
                self.event_pool_workers.set(workers)
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Current value of an entry in string form
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            LOCAL_EID => self.local_eid.get().to_string(),
            ALIASES => self
                .aliases
                .get()
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(","),
            COMPONENT_ENABLE_CONNECTION_AGENT => {
                self.component_enable_connection_agent.get().to_string()
            }
            COMPONENT_ENABLE_REGISTRAR => self.component_enable_registrar.get().to_string(),
            COMPONENT_ENABLE_LOGGING => self.component_enable_logging.get().to_string(),
            ENABLE_AUTO_CONNECT_FOR_DETECT_EVENT => {
                self.enable_auto_connect_for_detect_event.get().to_string()
            }
            ENABLE_AUTO_CONNECT_FOR_BUNDLE => self.enable_auto_connect_for_bundle.get().to_string(),
            ENABLE_LINKLOCAL_ROUTING => self.enable_linklocal_routing.get().to_string(),
            LOG_LEVEL => self.log_level.get().to_string(),
            CLA_NAME_FOR_DETECT => self.cla_name_for_detect.get(),
            DETECT_DEFAULT_PORT => self.detect_default_port.get().to_string(),
            EVENT_POOL_WORKERS => self.event_pool_workers.get().to_string(),
            _ => return None,
        };
        Some(value)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        // The default settings hold valid EIDs
        Self::from_settings(&Settings::default()).unwrap_or_else(|_| unreachable!())
    }
}
