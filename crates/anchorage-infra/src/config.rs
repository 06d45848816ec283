//! Engine configuration loader.
//!
//! Reads `anchorage.toml` and deserializes it into [`EngineConfig`]. Falls
//! back to defaults when the file is missing, malformed, or fails
//! validation.

use std::path::{Path, PathBuf};

use anchorage_types::config::EngineConfig;

use crate::sqlite::pool::default_data_dir;

/// File name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "anchorage.toml";

/// `{data_dir}/anchorage.toml`.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join(CONFIG_FILE_NAME)
}

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse or validate, logs a warning and
///   returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    let config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match config.validate() {
        Ok(()) => config,
        Err(err) => {
            tracing::warn!("Invalid config in {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}
