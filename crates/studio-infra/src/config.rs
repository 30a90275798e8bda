//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.studio/` in production)
//! and deserializes it into `EngineConfig`. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use studio_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: returns `EngineConfig::default()`.
/// - Unreadable or unparseable file: logs a warning, returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("no config.toml at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}
