// Settings file location for the dtnode CLI
//
// Cross-platform settings stored in:
// - macOS: ~/Library/Application Support/dtnode/settings.json
// - Linux: ~/.config/dtnode/settings.json
// - Windows: %APPDATA%\dtnode\settings.json

use anyhow::{Context, Result};
use dtnode_core::config::{NodeConfig, Settings};
use std::path::{Path, PathBuf};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("dtnode"))
}

/// Get the data directory path, used for log files
pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .context("Failed to determine data directory")?
        .join("dtnode");

    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
    Ok(data_dir)
}

/// Settings path: the explicit one, else the default location
pub fn settings_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_dir()?.join("settings.json")),
    }
}

/// Load the settings file (creating defaults) into a live node configuration
pub fn load(path: &Path) -> Result<NodeConfig> {
    let settings = Settings::load_or_create(path)?;
    NodeConfig::from_settings(&settings)
        .with_context(|| format!("Invalid settings in {}", path.display()))
}

/// Apply one `KEY=value` change and persist it
pub fn set(path: &Path, key: &str, value: &str) -> Result<NodeConfig> {
    let config = load(path)?;
    config
        .set(&key.to_ascii_uppercase(), value)
        .with_context(|| format!("Cannot set {}", key))?;
    config.to_settings().save(path)?;
    Ok(config)
}
