use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_name: String,
    pub server_url: String,
    #[serde(default = "default_identity_path")]
    pub identity_path: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_schedule_recheck")]
    pub schedule_recheck_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// IANA zone the schedule rules are written in. System zone when unset.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Public address of the server, used in companion viewer links.
    pub viewer_base_url: String,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub widgets: WidgetsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpvConfig {
    pub binary: String,
    pub display_socket: String,
    pub audio_socket: String,
    pub fullscreen: bool,
    /// Chromium binary for iframe items. Looked up on PATH when unset.
    pub browser_binary: Option<String>,
}

impl Default for MpvConfig {
    fn default() -> Self {
        Self {
            binary: "mpv".to_string(),
            display_socket: "/tmp/marquee-display.sock".to_string(),
            audio_socket: "/tmp/marquee-music.sock".to_string(),
            fullscreen: true,
            browser_binary: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Start plain video items muted.
    pub video_starts_muted: bool,
    pub error_advance_delay_ms: u64,
    pub unmute_check_delay_ms: u64,
    pub music_retry_ms: u64,
    pub foreground_volume: f64,
    pub music_volume: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            video_starts_muted: false,
            error_advance_delay_ms: 100,
            unmute_check_delay_ms: 500,
            music_retry_ms: 1000,
            foreground_volume: 100.0,
            music_volume: 70.0,
        }
    }
}

impl PlaybackConfig {
    pub fn error_advance_delay(&self) -> Duration {
        Duration::from_millis(self.error_advance_delay_ms)
    }

    pub fn unmute_check_delay(&self) -> Duration {
        Duration::from_millis(self.unmute_check_delay_ms)
    }

    pub fn music_retry_delay(&self) -> Duration {
        Duration::from_millis(self.music_retry_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetsConfig {
    pub geocoding_url: String,
    pub forecast_url: String,
    pub rates_url: String,
    pub default_news_feed: String,
    pub request_timeout_secs: u64,
    pub weather_refresh_mins: u64,
    pub news_refresh_mins: u64,
    pub currency_refresh_mins: u64,
}

impl Default for WidgetsConfig {
    fn default() -> Self {
        Self {
            geocoding_url: "https://geocoding-api.open-meteo.com/v1/search".to_string(),
            forecast_url: "https://api.open-meteo.com/v1/forecast".to_string(),
            rates_url: "https://open.er-api.com/v6/latest".to_string(),
            default_news_feed: "https://feeds.bbci.co.uk/news/world/rss.xml".to_string(),
            request_timeout_secs: 15,
            weather_refresh_mins: 30,
            news_refresh_mins: 30,
            currency_refresh_mins: 60,
        }
    }
}

fn default_identity_path() -> String {
    "marquee-identity.json".to_string()
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_schedule_recheck() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn default_template() -> &'static str {
        r#"node_name = "Lobby"
server_url = "ws://127.0.0.1:8080/ws"
viewer_base_url = "http://127.0.0.1:8080"
identity_path = "marquee-identity.json"
heartbeat_interval_secs = 60
schedule_recheck_secs = 60
request_timeout_secs = 10
# Zone the schedule rules are written in; defaults to the system zone.
# timezone = "Europe/Madrid"

[mpv]
binary = "mpv"
display_socket = "/tmp/marquee-display.sock"
audio_socket = "/tmp/marquee-music.sock"
fullscreen = true
# browser_binary = "/usr/bin/chromium"

[playback]
video_starts_muted = false
error_advance_delay_ms = 100
unmute_check_delay_ms = 500
music_retry_ms = 1000
foreground_volume = 100.0
music_volume = 70.0

[widgets]
geocoding_url = "https://geocoding-api.open-meteo.com/v1/search"
forecast_url = "https://api.open-meteo.com/v1/forecast"
rates_url = "https://open.er-api.com/v6/latest"
default_news_feed = "https://feeds.bbci.co.uk/news/world/rss.xml"
request_timeout_secs = 15
weather_refresh_mins = 30
news_refresh_mins = 30
currency_refresh_mins = 60
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses() {
        let config: Config = toml::from_str(Config::default_template()).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 60);
        assert!(!config.playback.video_starts_muted);
        assert_eq!(config.widgets.currency_refresh_mins, 60);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"node_name = "Bar"
server_url = "ws://server:8080/ws"
viewer_base_url = "http://server:8080"
"#,
        )
        .unwrap();
        assert_eq!(config.schedule_recheck_secs, 60);
        assert_eq!(config.playback.error_advance_delay(), Duration::from_millis(100));
        assert_eq!(config.mpv.binary, "mpv");
        assert_eq!(config.timezone, None);
    }
}
