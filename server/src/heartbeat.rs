//! Master server registration
//!
//! While `register_server` is enabled the server reports itself to the
//! master server every [`HEARTBEAT_INTERVAL`]. Failures only affect whether
//! the server shows up in the browser; they are logged once per outage.

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::session_manager::SessionManager;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Body of one heartbeat request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatReport {
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub map: String,
    /// Comma separated display names
    pub players: String,
    #[serde(rename = "maxplayers")]
    pub max_players: usize,
}

impl HeartbeatReport {
    pub fn new(config: &ServerConfig, player_names: &[String]) -> Self {
        Self {
            ip: config.host.clone(),
            port: config.port,
            name: config.name.clone(),
            map: config.current_map().to_string(),
            players: player_names.join(", "),
            max_players: config.player_capacity(),
        }
    }
}

/// The master server acknowledges a heartbeat with a body containing `true`.
pub fn is_acknowledged(body: &str) -> bool {
    body.contains("true")
}

pub struct Heartbeat {
    client: reqwest::Client,
    config: Arc<ServerConfig>,
    sessions: Arc<RwLock<SessionManager>>,
}

impl Heartbeat {
    pub fn new(
        client: reqwest::Client,
        config: Arc<ServerConfig>,
        sessions: Arc<RwLock<SessionManager>>,
    ) -> Self {
        Self {
            client,
            config,
            sessions,
        }
    }

    /// Sends one heartbeat.
    pub async fn send(&self) -> Result<()> {
        let names = self.sessions.read().await.player_names();
        let report = HeartbeatReport::new(&self.config, &names);
        debug!("Sending a heartbeat to the master server");

        let body = self
            .client
            .post(&self.config.master_server)
            .json(&report)
            .send()
            .await?
            .text()
            .await?;
        if !is_acknowledged(&body) {
            return Err(ServerError::MasterServer(body));
        }
        Ok(())
    }

    /// Reports forever.
    pub async fn run(self) {
        let mut lost = false;
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            match self.send().await {
                Ok(()) if lost => {
                    info!("Regained connection with the master server");
                    lost = false;
                }
                Ok(()) => {}
                Err(e) if !lost => {
                    warn!("Error while sending data to master server: {}", e);
                    lost = true;
                }
                Err(e) => debug!("Heartbeat failed again: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_fields() {
        let config = ServerConfig::default();
        let report = HeartbeatReport::new(&config, &["Artemis".to_string(), "Bob".to_string()]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ip"], "0.0.0.0");
        assert_eq!(json["port"], 1518);
        assert_eq!(json["map"], "map1");
        assert_eq!(json["players"], "Artemis, Bob");
        assert_eq!(json["maxplayers"], 16);
    }

    #[test]
    fn test_acknowledgement_detection() {
        assert!(is_acknowledged(r#"{"success": true}"#));
        assert!(!is_acknowledged("<html>502 Bad Gateway</html>"));
    }
}
