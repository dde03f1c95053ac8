use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ITEM_SECS: f64 = 10.0;
pub const DEFAULT_PANEL_SECS: f64 = 15.0;
/// Longer durations are clamped to one day.
pub const MAX_ITEM_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    #[default]
    Simple,
    Advanced,
}

// Anything other than "advanced" (including null or a typo) behaves as simple.
impl<'de> Deserialize<'de> for SchedulingMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(match raw.as_deref().map(str::trim) {
            Some(mode) if mode.eq_ignore_ascii_case("advanced") => SchedulingMode::Advanced,
            _ => SchedulingMode::Simple,
        })
    }
}

/// A day/time window mapped to playlist ids. Times stay as strings so a
/// malformed rule can be carried around and fail closed at match time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleRule {
    pub days: Vec<i64>,
    pub start_time: String,
    pub end_time: String,
    pub playlist_id: Option<String>,
    pub music_playlist_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClockWidget {
    pub enabled: bool,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeatherWidget {
    pub enabled: bool,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewsWidget {
    pub enabled: bool,
    pub feed_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CurrencyWidget {
    pub enabled: bool,
    pub base: String,
    pub symbols: Vec<String>,
}

impl Default for CurrencyWidget {
    fn default() -> Self {
        Self {
            enabled: false,
            base: "USD".to_string(),
            symbols: vec!["EUR".to_string(), "GBP".to_string()],
        }
    }
}

/// One physical or virtual screen, as the management layer stores it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub name: String,
    pub pairing_code: Option<String>,
    pub is_paired: bool,
    pub managed_by_group: bool,
    pub group_id: Option<String>,
    pub playlist_id: Option<String>,
    pub music_playlist_id: Option<String>,
    pub visual_scheduling_mode: SchedulingMode,
    pub music_scheduling_mode: SchedulingMode,
    #[serde(deserialize_with = "lenient_vec")]
    pub visual_schedule_rules: Vec<ScheduleRule>,
    #[serde(deserialize_with = "lenient_vec")]
    pub music_schedule_rules: Vec<ScheduleRule>,
    /// Mirror of the group's mode, written by the management layer.
    pub scheduling_mode: SchedulingMode,
    /// Mirror of the group's rules, written by the management layer.
    #[serde(deserialize_with = "lenient_vec")]
    pub schedule_rules: Vec<ScheduleRule>,
    pub clock_widget: ClockWidget,
    pub weather_widget: WeatherWidget,
    pub news_widget: NewsWidget,
    pub currency_widget: CurrencyWidget,
    pub qr_enabled: bool,
    #[serde(deserialize_with = "lenient_vec")]
    pub qr_code_items: Vec<String>,
    pub last_heartbeat: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Group {
    pub name: String,
    #[serde(deserialize_with = "lenient_vec")]
    pub screens: Vec<String>,
    pub playlist_id: Option<String>,
    pub music_playlist_id: Option<String>,
    pub scheduling_mode: SchedulingMode,
    #[serde(deserialize_with = "lenient_vec")]
    pub schedule_rules: Vec<ScheduleRule>,
}

impl Group {
    pub fn contains(&self, device_id: &str) -> bool {
        self.screens.iter().any(|s| s == device_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QrTarget {
    Url(String),
    Menu(String),
}

/// A visual playlist entry. Decoded leniently from the stored shape, where
/// `type` is either a bare kind or a MIME type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawItem")]
pub enum Item {
    Image {
        url: String,
        duration: Duration,
    },
    Video {
        url: String,
        max_duration: Option<Duration>,
    },
    Youtube {
        url: String,
        max_duration: Option<Duration>,
    },
    Iframe {
        url: String,
        duration: Duration,
    },
    Weather {
        location: Option<String>,
        duration: Duration,
    },
    Clock {
        timezone: Option<String>,
        duration: Duration,
    },
    QrCode {
        target: QrTarget,
        text: String,
        duration: Duration,
    },
    Unsupported {
        kind: String,
    },
}

impl Item {
    /// Items that own the audible foreground while shown.
    pub fn is_foreground_media(&self) -> bool {
        matches!(
            self,
            Item::Video { .. } | Item::Youtube { .. } | Item::Iframe { .. }
        )
    }

    pub fn kind(&self) -> &str {
        match self {
            Item::Image { .. } => "image",
            Item::Video { .. } => "video",
            Item::Youtube { .. } => "youtube",
            Item::Iframe { .. } => "iframe",
            Item::Weather { .. } => "weather",
            Item::Clock { .. } => "clock",
            Item::QrCode { .. } => "qrcode",
            Item::Unsupported { kind } => kind,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawItem {
    #[serde(rename = "type")]
    kind: String,
    url: Option<String>,
    duration: Option<f64>,
    location: Option<String>,
    timezone: Option<String>,
    target_url: Option<String>,
    menu_id: Option<String>,
    text: Option<String>,
}

fn seconds(raw: Option<f64>, default: f64) -> Duration {
    explicit_seconds(raw).unwrap_or_else(|| Duration::from_secs_f64(default))
}

fn explicit_seconds(raw: Option<f64>) -> Option<Duration> {
    raw.filter(|secs| secs.is_finite() && *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs.min(MAX_ITEM_SECS)).ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl From<RawItem> for Item {
    fn from(raw: RawItem) -> Self {
        let kind = raw.kind.trim().to_ascii_lowercase();
        // "image/png" -> "image", "video/mp4" -> "video"
        let family = kind.split('/').next().unwrap_or_default().to_string();
        let url = non_empty(raw.url);

        match (family.as_str(), url) {
            ("image", Some(url)) => Item::Image {
                url,
                duration: seconds(raw.duration, DEFAULT_ITEM_SECS),
            },
            ("video", Some(url)) => Item::Video {
                url,
                max_duration: explicit_seconds(raw.duration),
            },
            ("youtube", Some(url)) => Item::Youtube {
                url,
                max_duration: explicit_seconds(raw.duration),
            },
            ("iframe", Some(url)) => Item::Iframe {
                url,
                duration: seconds(raw.duration, DEFAULT_PANEL_SECS),
            },
            ("weather", _) => Item::Weather {
                location: non_empty(raw.location),
                duration: seconds(raw.duration, DEFAULT_PANEL_SECS),
            },
            ("clock", _) => Item::Clock {
                timezone: non_empty(raw.timezone),
                duration: seconds(raw.duration, DEFAULT_ITEM_SECS),
            },
            ("qrcode", url) => {
                let target = non_empty(raw.target_url)
                    .or(url)
                    .map(QrTarget::Url)
                    .or_else(|| non_empty(raw.menu_id).map(QrTarget::Menu));
                match target {
                    Some(target) => Item::QrCode {
                        target,
                        text: raw.text.unwrap_or_default(),
                        duration: seconds(raw.duration, DEFAULT_PANEL_SECS),
                    },
                    None => Item::Unsupported {
                        kind: "qrcode without target".to_string(),
                    },
                }
            }
            (_, None) if !family.is_empty() => Item::Unsupported {
                kind: format!("{} without url", family),
            },
            _ => Item::Unsupported { kind },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisualPlaylist {
    pub name: String,
    #[serde(deserialize_with = "lenient_vec")]
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MusicPlaylist {
    pub name: String,
    #[serde(deserialize_with = "lenient_vec")]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaRecord {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Decodes a list element by element, dropping entries that do not fit
/// instead of rejecting the whole record.
fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Dropping malformed list entry: {}", e);
                None
            }
        })
        .collect())
}
