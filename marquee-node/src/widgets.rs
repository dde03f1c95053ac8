use chrono::{DateTime, Local, Timelike, Utc};
use chrono_tz::Tz;
use qrcode::render::unicode::Dense1x2;
use qrcode::QrCode;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WidgetsConfig;
use crate::events::{PlayerEvent, TimerSlot, WidgetUpdate};
use crate::model::{Device, QrTarget};
use crate::stage::Stage;
use crate::surface::OverlaySlot;
use crate::widget_sources::{WeatherReport, WidgetSources};

const MAX_HEADLINES: usize = 5;

/// Wall clock in `timezone`, or the system zone when it is absent or unknown.
pub fn local_time(timezone: Option<&str>, now: DateTime<Utc>) -> String {
    clock_format(timezone, now, "%H:%M")
}

fn clock_format(timezone: Option<&str>, now: DateTime<Utc>, format: &str) -> String {
    match timezone.and_then(|name| name.parse::<Tz>().ok()) {
        Some(tz) => now.with_timezone(&tz).format(format).to_string(),
        None => now.with_timezone(&Local).format(format).to_string(),
    }
}

pub fn clock_panel(timezone: Option<&str>, now: DateTime<Utc>) -> String {
    clock_format(timezone, now, "%H:%M:%S\n%A, %-d %B %Y")
}

pub fn weather_panel(report: &WeatherReport) -> String {
    format!(
        "{}\n{:.0}°C  {}\nWind {:.0} km/h",
        report.place,
        report.temperature_c,
        report.summary(),
        report.wind_kmh
    )
}

fn weather_line(report: &WeatherReport) -> String {
    format!("{} {:.0}°C {}", report.place, report.temperature_c, report.summary())
}

pub fn qr_block(link: &str) -> Option<String> {
    match QrCode::new(link.as_bytes()) {
        Ok(code) => Some(
            code.render::<Dense1x2>()
                .dark_color(Dense1x2::Light)
                .light_color(Dense1x2::Dark)
                .build(),
        ),
        Err(e) => {
            tracing::warn!("Cannot encode '{}' as a QR code: {}", link, e);
            None
        }
    }
}

pub fn qr_link(viewer_base_url: &str, target: &QrTarget) -> String {
    let base = viewer_base_url.trim_end_matches('/');
    match target {
        QrTarget::Url(url) => url.clone(),
        QrTarget::Menu(menu_id) => format!("{}/viewer/menu/{}", base, menu_id),
    }
}

pub fn qr_panel(viewer_base_url: &str, target: &QrTarget, caption: &str) -> String {
    let link = qr_link(viewer_base_url, target);
    match qr_block(&link) {
        Some(block) if caption.is_empty() => format!("{}\n{}", block, link),
        Some(block) => format!("{}\n{}\n{}", caption, block, link),
        None => format!("{}\n{}", caption, link),
    }
}

/// Content address of a companion selection: the first 16 hex characters
/// of SHA-256 over the newline-joined media ids. Any change to the
/// selection changes the link.
pub fn companion_digest(media_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(media_ids.join("\n").as_bytes());
    let hash = hasher.finalize();
    hash.iter()
        .take(8)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

fn delay_to_next_minute(now: DateTime<Utc>) -> Duration {
    Duration::from_secs(60 - u64::from(now.second()).min(59))
}

/// What an overlay shows, as configured on the device.
#[derive(Debug, Clone, PartialEq)]
enum Overlay {
    Clock { timezone: Option<String> },
    Weather { location: String },
    News { feed_url: String },
    Currency { base: String, symbols: Vec<String> },
    Qr { link: String },
}

/// Toggles and refreshes the decorative overlays from device settings.
/// Failures hide the overlay until its next refresh.
pub struct WidgetOrchestrator {
    sources: Arc<dyn WidgetSources>,
    config: WidgetsConfig,
    viewer_base_url: String,
    active: HashMap<OverlaySlot, Overlay>,
    seqs: HashMap<OverlaySlot, u64>,
    next_seq: u64,
}

impl WidgetOrchestrator {
    pub fn new(sources: Arc<dyn WidgetSources>, config: WidgetsConfig, viewer_base_url: String) -> Self {
        Self {
            sources,
            config,
            viewer_base_url,
            active: HashMap::new(),
            seqs: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn viewer_base_url(&self) -> &str {
        &self.viewer_base_url
    }

    pub fn refresh_interval(&self, slot: OverlaySlot) -> Option<Duration> {
        let minutes = match slot {
            OverlaySlot::Weather => self.config.weather_refresh_mins,
            OverlaySlot::News => self.config.news_refresh_mins,
            OverlaySlot::Currency => self.config.currency_refresh_mins,
            OverlaySlot::Clock | OverlaySlot::Qr => return None,
        };
        Some(Duration::from_secs(minutes.max(1) * 60))
    }

    fn desired(&self, device: &Device, device_id: &str) -> HashMap<OverlaySlot, Overlay> {
        let mut wanted = HashMap::new();

        if device.clock_widget.enabled {
            wanted.insert(
                OverlaySlot::Clock,
                Overlay::Clock {
                    timezone: device.clock_widget.timezone.clone(),
                },
            );
        }
        if device.weather_widget.enabled {
            if let Some(location) = device.weather_widget.location.as_deref().map(str::trim) {
                if !location.is_empty() {
                    wanted.insert(
                        OverlaySlot::Weather,
                        Overlay::Weather {
                            location: location.to_string(),
                        },
                    );
                }
            }
        }
        if device.news_widget.enabled {
            let feed_url = device
                .news_widget
                .feed_url
                .clone()
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| self.config.default_news_feed.clone());
            wanted.insert(OverlaySlot::News, Overlay::News { feed_url });
        }
        if device.currency_widget.enabled && !device.currency_widget.symbols.is_empty() {
            wanted.insert(
                OverlaySlot::Currency,
                Overlay::Currency {
                    base: device.currency_widget.base.to_ascii_uppercase(),
                    symbols: device.currency_widget.symbols.clone(),
                },
            );
        }
        if device.qr_enabled && !device.qr_code_items.is_empty() {
            let link = format!(
                "{}/viewer/{}/{}",
                self.viewer_base_url.trim_end_matches('/'),
                device_id,
                companion_digest(&device.qr_code_items)
            );
            wanted.insert(OverlaySlot::Qr, Overlay::Qr { link });
        }

        wanted
    }

    /// Brings the overlays in line with the device settings. Unchanged
    /// overlays are left alone.
    pub fn apply(&mut self, device: &Device, device_id: &str, stage: &mut Stage) {
        let mut wanted = self.desired(device, device_id);

        for slot in OverlaySlot::ALL {
            let next = wanted.remove(&slot);
            if self.active.get(&slot) == next.as_ref() {
                continue;
            }
            match next {
                Some(overlay) => {
                    tracing::info!("Widget {:?} enabled", slot);
                    self.active.insert(slot, overlay);
                    self.refresh(slot, stage);
                }
                None => {
                    tracing::info!("Widget {:?} disabled", slot);
                    self.active.remove(&slot);
                    self.hide(slot, stage);
                }
            }
        }
    }

    fn bump(&mut self, slot: OverlaySlot) -> u64 {
        self.next_seq += 1;
        self.seqs.insert(slot, self.next_seq);
        self.next_seq
    }

    fn hide(&mut self, slot: OverlaySlot, stage: &mut Stage) {
        self.bump(slot);
        if slot == OverlaySlot::Clock {
            stage.timers.cancel(TimerSlot::ClockOverlay);
        }
        set_overlay(stage, slot, None);
    }

    /// Re-renders an enabled overlay; fetch-backed ones update when the
    /// fetch completes.
    pub fn refresh(&mut self, slot: OverlaySlot, stage: &mut Stage) {
        let Some(overlay) = self.active.get(&slot).cloned() else {
            return;
        };
        let seq = self.bump(slot);

        match overlay {
            Overlay::Clock { timezone } => {
                let now = Utc::now();
                set_overlay(stage, slot, Some(&local_time(timezone.as_deref(), now)));
                stage
                    .timers
                    .arm(TimerSlot::ClockOverlay, delay_to_next_minute(now));
            }
            Overlay::Qr { link } => {
                let text = qr_block(&link).map(|block| format!("{}\n{}", block, link));
                set_overlay(stage, slot, text.as_deref());
            }
            Overlay::Weather { location } => {
                let sources = Arc::clone(&self.sources);
                spawn_fetch(stage, slot, seq, async move {
                    sources
                        .weather(&location)
                        .await
                        .map(|report| weather_line(&report))
                        .map_err(|e| e.to_string())
                });
            }
            Overlay::News { feed_url } => {
                let sources = Arc::clone(&self.sources);
                spawn_fetch(stage, slot, seq, async move {
                    let headlines = sources.headlines(&feed_url).await.map_err(|e| e.to_string())?;
                    if headlines.is_empty() {
                        return Err("feed has no items".to_string());
                    }
                    Ok(headlines
                        .into_iter()
                        .take(MAX_HEADLINES)
                        .collect::<Vec<_>>()
                        .join("  •  "))
                });
            }
            Overlay::Currency { base, symbols } => {
                let sources = Arc::clone(&self.sources);
                spawn_fetch(stage, slot, seq, async move {
                    let rates = sources.rates(&base, &symbols).await.map_err(|e| e.to_string())?;
                    let quotes: Vec<String> = rates
                        .iter()
                        .map(|(symbol, rate)| format!("{} {:.4}", symbol, rate))
                        .collect();
                    Ok(format!("{}  {}", base, quotes.join("  ")))
                });
            }
        }
    }

    pub fn on_clock_tick(&mut self, stage: &mut Stage) {
        self.refresh(OverlaySlot::Clock, stage);
    }

    pub fn on_update(&mut self, slot: OverlaySlot, seq: u64, text: Option<String>, stage: &mut Stage) {
        if self.seqs.get(&slot) != Some(&seq) || !self.active.contains_key(&slot) {
            return;
        }
        set_overlay(stage, slot, text.as_deref());
    }

    pub fn clear(&mut self, stage: &mut Stage) {
        for slot in OverlaySlot::ALL {
            if self.active.remove(&slot).is_some() {
                self.hide(slot, stage);
            }
        }
    }
}

fn set_overlay(stage: &mut Stage, slot: OverlaySlot, text: Option<&str>) {
    if let Err(e) = stage.surface.set_overlay(slot, text) {
        tracing::warn!("Failed to update {:?} overlay: {}", slot, e);
    }
}

fn spawn_fetch<F>(stage: &Stage, slot: OverlaySlot, seq: u64, fetch: F)
where
    F: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    let events = stage.events.clone();
    tokio::spawn(async move {
        let text = match fetch.await {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("Widget {:?} unavailable, hiding it: {}", slot, e);
                None
            }
        };
        let _ = events.send(PlayerEvent::Widget(WidgetUpdate::Overlay { slot, seq, text }));
    });
}
