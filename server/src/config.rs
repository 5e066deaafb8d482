//! Server configuration loaded from a TOML file
//!
//! A missing file is created from the defaults so operators get a template
//! to edit. Command line flags may override a handful of values after
//! loading; nothing mutates the configuration once the server is running.

use crate::error::{Result, ServerError};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Number of addressable player slots (slot ids are one byte).
pub const MAX_SLOTS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name shown in the server browser
    pub name: String,
    /// Address to bind and to report to the master server
    pub host: String,
    pub port: u16,
    pub max_players: usize,
    /// Map rotation; the first entry is played at startup
    pub maps: Vec<String>,
    pub verbose: bool,
    /// Simulation tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// Accept every token without asking the API
    pub insecure: bool,
    /// Accept tokens when the API can't be reached
    pub auto_insecure: bool,
    /// Send heartbeats to the master server
    pub register_server: bool,
    /// Account ids with operator rights
    pub operators: Vec<String>,
    pub api_server: String,
    pub master_server: String,
    /// Capacity of the bounded network and command queues
    pub channel_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Arena Server".to_string(),
            host: "0.0.0.0".to_string(),
            port: 1518,
            max_players: 16,
            maps: vec!["map1".to_string(), "map2".to_string(), "map3".to_string()],
            verbose: false,
            tick_interval_ms: 15,
            insecure: false,
            auto_insecure: false,
            register_server: true,
            operators: Vec::new(),
            api_server: "https://api.arena.invalid/api".to_string(),
            master_server: "https://master.arena.invalid".to_string(),
            channel_size: 64,
        }
    }
}

impl ServerConfig {
    /// Loads the config at `path`, writing the defaults there first if the
    /// file doesn't exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(
                "Config file {} not found, creating the default one",
                path.display()
            );
            let defaults = Self::default();
            std::fs::write(path, defaults.to_toml()?)?;
            return Ok(defaults);
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ServerError::Config(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ServerError::Config(format!("cannot serialize config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.maps.is_empty() {
            return Err(ServerError::Config("map rotation is empty".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ServerError::Config(
                "tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.channel_size == 0 {
            return Err(ServerError::Config(
                "channel_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Player cap clamped to the number of slot ids.
    pub fn player_capacity(&self) -> usize {
        self.max_players.min(MAX_SLOTS)
    }

    pub fn current_map(&self) -> &str {
        self.maps.first().map(String::as_str).unwrap_or_default()
    }

    pub fn is_operator(&self, account: &str) -> bool {
        self.operators
            .iter()
            .any(|op| op.eq_ignore_ascii_case(account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_millis(15));
        assert_eq!(config.current_map(), "map1");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            name = "Test"
            port = 4000
            maps = ["arena"]
            operators = ["Alice"]
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "Test");
        assert_eq!(config.port, 4000);
        assert_eq!(config.current_map(), "arena");
        assert_eq!(config.max_players, 16);
        assert!(config.is_operator("alice"));
        assert!(!config.is_operator("bob"));
    }

    #[test]
    fn test_empty_map_rotation_is_rejected() {
        let result = ServerConfig::from_toml("maps = []");
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_player_capacity_is_clamped() {
        let config = ServerConfig {
            max_players: 1000,
            ..ServerConfig::default()
        };
        assert_eq!(config.player_capacity(), MAX_SLOTS);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ServerConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(ServerConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let path = std::env::temp_dir().join(format!("arena-config-{}.toml", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let created = ServerConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = ServerConfig::load_or_create(&path).unwrap();
        assert_eq!(created, loaded);

        let _ = std::fs::remove_file(&path);
    }
}
