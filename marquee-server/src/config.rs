use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub https: Option<HttpsConfig>,
    /// Buffered changes per connection before it has to resync.
    #[serde(default = "default_feed_capacity")]
    pub change_feed_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// A device is online if it sent a heartbeat within this many seconds.
    pub online_window_secs: i64,
    pub monitor_interval_secs: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            online_window_secs: 150,
            monitor_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_feed_capacity() -> usize {
    256
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_template() -> &'static str {
        r#"[server]
host = "0.0.0.0"
port = 8080
change_feed_capacity = 256

[server.https]
enabled = false
cert_path = "certs/cert.pem"
key_path = "certs/key.pem"

[database]
# Path of the SQLite database. Ensure the directory exists.
url = "sqlite://marquee.db"

[devices]
online_window_secs = 150
monitor_interval_secs = 30

[logging]
level = "info"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let config: Config = toml::from_str(Config::default_template()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.devices.online_window_secs, 150);
    }

    #[test]
    fn test_devices_section_is_optional() {
        let config: Config = toml::from_str(
            r#"[server]
host = "127.0.0.1"
port = 9000

[database]
url = "marquee.db"

[logging]
level = "debug"
"#,
        )
        .unwrap();
        assert_eq!(config.devices.monitor_interval_secs, 30);
        assert_eq!(config.server.change_feed_capacity, 256);
    }
}
