// src/config.rs

//! Configuration loading utilities.

use std::path::Path;

use crate::error::Result;
use crate::models::{Config, Credential};

/// Load configuration from a TOML file.
///
/// Falls back to defaults if loading fails.
pub fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).or_else(|e| {
        log::warn!("Failed to load config from {path:?}: {e}");
        log::warn!("Using default configuration.");
        Ok(Config::default())
    })
}

/// Resolve account entries into worker credentials.
pub fn credentials_from(config: &Config) -> Vec<Credential> {
    config
        .accounts
        .iter()
        .map(|account| Credential {
            username: account.username.clone(),
            password: account.password.clone(),
            app_password: account.app_password.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.collector.batch_size, 100);
        assert!(config.accounts.is_empty());
    }
}
