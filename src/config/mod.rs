mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./config.toml",
        "./livecast.toml",
        "~/.config/livecast/config.toml",
        "/etc/livecast/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if let Some(dir) = &config.server.static_dir {
        if !dir.is_dir() {
            tracing::warn!("Static directory does not exist: {:?}", dir);
        }
    }

    if config.stream.queue_capacity == 0 {
        anyhow::bail!("stream.queue_capacity must be at least 1");
    }

    if config.stream.max_clients == 0 {
        anyhow::bail!("stream.max_clients must be at least 1");
    }

    if config.stream.read_buffer_size == 0 {
        anyhow::bail!("stream.read_buffer_size must be at least 1");
    }

    if config.stream.max_box_size < 16 {
        anyhow::bail!(
            "stream.max_box_size ({}) is smaller than a box header",
            config.stream.max_box_size
        );
    }

    if config.encoder.enabled && config.encoder.program.trim().is_empty() {
        anyhow::bail!("Encoder is enabled but no program is configured");
    }

    Ok(())
}
