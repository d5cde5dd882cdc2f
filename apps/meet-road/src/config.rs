use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("MEET_ROAD_HOST")
                .ok()
                .map(|host| host.trim().to_string())
                .filter(|host| !host.is_empty())
                .unwrap_or(defaults.host),
            port: env::var("MEET_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            heartbeat_interval_seconds: env::var("MEET_ROAD_HEARTBEAT_INTERVAL_SECS")
                .ok()
                .and_then(|val| val.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.heartbeat_interval_seconds),
            heartbeat_timeout_seconds: env::var("MEET_ROAD_HEARTBEAT_TIMEOUT_SECS")
                .ok()
                .and_then(|val| val.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.heartbeat_timeout_seconds),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            heartbeat_interval_seconds: 30,
            heartbeat_timeout_seconds: 120, // four missed client pings
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_bind_all_interfaces() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(config.heartbeat_timeout() > config.heartbeat_interval());
    }
}
