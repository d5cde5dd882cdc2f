use std::env;
use std::time::Duration;

use crate::peer::PeerConfig;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8080/ws";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub stun_urls: Vec<String>,
    pub negotiation_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env::var("MEET_SERVER_URL")
                .ok()
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .unwrap_or(defaults.server_url),
            stun_urls: env::var("MEET_STUN_URLS")
                .ok()
                .map(|urls| parse_url_list(&urls))
                .unwrap_or(defaults.stun_urls),
            negotiation_timeout: env::var("MEET_NEGOTIATION_TIMEOUT_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.negotiation_timeout),
            heartbeat_interval: env::var("MEET_HEARTBEAT_SECS")
                .ok()
                .and_then(|secs| secs.parse().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
        }
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            negotiation_timeout: self.negotiation_timeout,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            negotiation_timeout: Duration::from_millis(5000),
            // Under the server's 30s sweep
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

/// Comma separated; empty entries dropped. An empty list disables STUN.
pub fn parse_url_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}
