//! Logging setup
//!
//! The node's log level is a live configuration entry. The installed
//! `EnvFilter` sits behind a reload layer and a watcher task swaps it whenever
//! `LOG_LEVEL` or `COMPONENT_ENABLE_LOGGING` change.

use crate::config::NodeConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Node log level, ordered from most to least verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Verbose => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Verbose => write!(f, "VERBOSE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VERBOSE" | "TRACE" => Ok(LogLevel::Verbose),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(LoggingError::UnknownLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Unknown log level: {0}")]
    UnknownLevel(String),

    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("Log filter reload failed: {0}")]
    Reload(String),
}

/// Filter for the given switch and level.
///
/// A disabled logging component yields a filter that lets nothing through.
pub fn filter_for(enabled: bool, level: LogLevel) -> EnvFilter {
    if enabled {
        EnvFilter::new(level.as_directive())
    } else {
        EnvFilter::new("off")
    }
}

/// Keeps the logging pipeline alive; drop it only at process exit
pub struct LoggingGuard {
    _appender: Option<tracing_appender::non_blocking::WorkerGuard>,
    watcher: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Install the global subscriber.
///
/// Writes to stderr, or to a daily-rotated file in `log_dir` when given.
/// Must be called from inside a tokio runtime so the level watcher can run.
pub fn init(config: &Arc<NodeConfig>, log_dir: Option<&Path>) -> Result<LoggingGuard, LoggingError> {
    let initial = filter_for(config.component_enable_logging.get(), config.log_level.get());
    let (filter, handle) = reload::Layer::<EnvFilter, Registry>::new(initial);

    let appender_guard = match log_dir {
        Some(dir) => {
            let file = tracing_appender::rolling::daily(dir, "dtnode.log");
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
            None
        }
    };

    let mut enabled_rx = config.component_enable_logging.subscribe();
    let mut level_rx = config.log_level.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = enabled_rx.changed() => if changed.is_err() { break },
                changed = level_rx.changed() => if changed.is_err() { break },
            }
            let enabled = *enabled_rx.borrow_and_update();
            let level = *level_rx.borrow_and_update();
            if let Err(e) = handle.reload(filter_for(enabled, level)) {
                eprintln!("{}", LoggingError::Reload(e.to_string()));
                break;
            }
        }
    });

    Ok(LoggingGuard {
        _appender: appender_guard,
        watcher: Some(watcher),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Verbose < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_level_parse_and_display() {
        for level in [
            LogLevel::Verbose,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), level);
        }
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("LOUD".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_filter_for_disabled_is_off() {
        assert_eq!(filter_for(false, LogLevel::Verbose).to_string(), "off");
        assert_eq!(filter_for(true, LogLevel::Verbose).to_string(), "trace");
    }

    #[test]
    fn test_serde_uses_uppercase_names() {
        let json = serde_json::to_string(&LogLevel::Verbose).unwrap();
        assert_eq!(json, "\"VERBOSE\"");
    }
}
