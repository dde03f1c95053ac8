use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::BlockedAction;
use crate::config::PlaybackConfig;
use crate::events::{MediaEvent, PlayerEvent, ShowToken, TimerSlot, WidgetUpdate};
use crate::model::Item;
use crate::stage::Stage;
use crate::widget_sources::WidgetSources;
use crate::widgets;
use crate::youtube::extract_video_id;

pub const NO_PLAYLIST: &str = "No visual playlist assigned";
pub const PLAYLIST_NOT_FOUND: &str = "Playlist not found";
pub const PLAYLIST_EMPTY: &str = "This playlist is empty";

const CLOCK_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub video_starts_muted: bool,
    pub error_advance_delay: Duration,
    pub unmute_check_delay: Duration,
    pub foreground_volume: f64,
    pub viewer_base_url: String,
}

impl EngineSettings {
    pub fn new(playback: &PlaybackConfig, viewer_base_url: &str) -> Self {
        Self {
            video_starts_muted: playback.video_starts_muted,
            error_advance_delay: playback.error_advance_delay(),
            unmute_check_delay: playback.unmute_check_delay(),
            foreground_volume: playback.foreground_volume,
            viewer_base_url: viewer_base_url.to_string(),
        }
    }
}

struct Active {
    token: ShowToken,
    item: Item,
}

/// The visual rotation. Every exit from an item cancels that item's timers
/// before anything else is shown.
pub struct PlaybackEngine {
    settings: EngineSettings,
    sources: Arc<dyn WidgetSources>,
    items: Vec<Item>,
    index: usize,
    active: Option<Active>,
    next_token: u64,
    message: Option<String>,
    weather_fallback: Option<String>,
}

impl PlaybackEngine {
    pub fn new(settings: EngineSettings, sources: Arc<dyn WidgetSources>) -> Self {
        Self {
            settings,
            sources,
            items: Vec::new(),
            index: 0,
            active: None,
            next_token: 0,
            message: None,
            weather_fallback: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn active_token(&self) -> Option<ShowToken> {
        self.active.as_ref().map(|active| active.token)
    }

    pub fn active_item(&self) -> Option<&Item> {
        self.active.as_ref().map(|active| &active.item)
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// True while a video, youtube or iframe item is on screen.
    pub fn holds_foreground(&self) -> bool {
        self.active_item().is_some_and(Item::is_foreground_media)
    }

    /// Location used by weather items that do not name one.
    pub fn set_weather_fallback(&mut self, location: Option<String>) {
        self.weather_fallback = location;
    }

    /// Installs the items of the watched playlist. Identical items while
    /// something is showing leave the rotation untouched; anything else
    /// restarts at the first item.
    pub fn load(&mut self, items: Vec<Item>, stage: &mut Stage) {
        if self.active.is_some() && items == self.items {
            return;
        }

        self.exit_current(stage);
        self.items = items;
        self.index = 0;

        if self.items.is_empty() {
            self.show_message(PLAYLIST_EMPTY, stage);
            return;
        }
        tracing::info!("Loaded playlist with {} items", self.items.len());
        self.show_current(stage);
    }

    /// Drops the rotation and shows `message` in its place.
    pub fn idle(&mut self, message: &str, stage: &mut Stage) {
        self.exit_current(stage);
        self.items.clear();
        self.index = 0;
        if self.message.as_deref() != Some(message) {
            self.show_message(message, stage);
        }
    }

    pub fn reset(&mut self, stage: &mut Stage) {
        self.exit_current(stage);
        self.items.clear();
        self.index = 0;
        self.message = None;
    }

    fn show_message(&mut self, message: &str, stage: &mut Stage) {
        tracing::info!("Visual idle: {}", message);
        self.message = Some(message.to_string());
        if let Err(e) = stage.surface.show_message(message) {
            tracing::warn!("Failed to show message: {}", e);
        }
    }

    fn exit_current(&mut self, stage: &mut Stage) {
        let Some(active) = self.active.take() else {
            return;
        };
        stage.timers.cancel(TimerSlot::VisualItem);
        stage.timers.cancel(TimerSlot::ClockTick);
        stage.timers.cancel(TimerSlot::UnmuteCheck);
        stage.withdraw(BlockedAction::ForegroundUnmute(active.token));
    }

    fn show_current(&mut self, stage: &mut Stage) {
        let Some(item) = self.items.get(self.index).cloned() else {
            return;
        };
        self.next_token += 1;
        let token = ShowToken(self.next_token);
        self.message = None;

        tracing::info!(
            "Showing item {}/{} ({})",
            self.index + 1,
            self.items.len(),
            item.kind()
        );

        let result = self.render(token, &item, stage);
        self.active = Some(Active { token, item });

        match result {
            Ok(Some(duration)) => {
                stage.timers.arm(TimerSlot::VisualItem, duration);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Skipping item {}: {}", self.index + 1, e);
                stage
                    .timers
                    .arm(TimerSlot::VisualItem, self.settings.error_advance_delay);
            }
        }
    }

    /// Puts `item` on screen and returns how long it should stay, if the
    /// item has a fixed length.
    fn render(&self, token: ShowToken, item: &Item, stage: &mut Stage) -> Result<Option<Duration>> {
        let surface = stage.surface.as_mut();
        match item {
            Item::Image { url, duration } => {
                surface.show_image(token, url)?;
                Ok(Some(*duration))
            }
            Item::Video { url, max_duration } => {
                surface.show_video(token, url, self.settings.video_starts_muted)?;
                Ok(*max_duration)
            }
            Item::Youtube { url, max_duration } => {
                let video_id = extract_video_id(url)
                    .ok_or_else(|| anyhow!("no YouTube video id in '{}'", url))?;
                surface.show_youtube(token, &video_id)?;
                Ok(*max_duration)
            }
            Item::Iframe { url, duration } => {
                surface.show_web_page(token, url)?;
                Ok(Some(*duration))
            }
            Item::Weather { location, duration } => {
                let location = location.clone().or_else(|| self.weather_fallback.clone());
                match location {
                    Some(location) => {
                        surface.show_panel(token, &format!("{}\n…", location))?;
                        self.fetch_weather(token, location, stage);
                    }
                    None => surface.show_panel(token, "Weather")?,
                }
                Ok(Some(*duration))
            }
            Item::Clock { timezone, duration } => {
                surface.show_panel(token, &widgets::clock_panel(timezone.as_deref(), Utc::now()))?;
                stage.timers.arm(TimerSlot::ClockTick, CLOCK_TICK);
                Ok(Some(*duration))
            }
            Item::QrCode {
                target,
                text,
                duration,
            } => {
                let panel = widgets::qr_panel(&self.settings.viewer_base_url, target, text);
                surface.show_panel(token, &panel)?;
                Ok(Some(*duration))
            }
            Item::Unsupported { kind } => Err(anyhow!("unsupported item type '{}'", kind)),
        }
    }

    fn fetch_weather(&self, token: ShowToken, location: String, stage: &Stage) {
        let sources = Arc::clone(&self.sources);
        let events = stage.events.clone();
        tokio::spawn(async move {
            match sources.weather(&location).await {
                Ok(report) => {
                    let text = widgets::weather_panel(&report);
                    let _ = events.send(PlayerEvent::Widget(WidgetUpdate::Panel { token, text }));
                }
                Err(e) => tracing::warn!("Weather for '{}' unavailable: {}", location, e),
            }
        });
    }

    pub fn advance(&mut self, stage: &mut Stage) {
        self.exit_current(stage);
        if self.items.is_empty() {
            return;
        }
        self.index = (self.index + 1) % self.items.len();
        self.show_current(stage);
    }

    fn is_current(&self, token: ShowToken) -> bool {
        self.active_token() == Some(token)
    }

    /// Handles a timer the stage has already confirmed as live.
    pub fn on_timer(&mut self, slot: TimerSlot, stage: &mut Stage) {
        match slot {
            TimerSlot::VisualItem => self.advance(stage),
            TimerSlot::ClockTick => {
                let Some(Active {
                    token,
                    item: Item::Clock { timezone, .. },
                }) = &self.active
                else {
                    return;
                };
                let panel = widgets::clock_panel(timezone.as_deref(), Utc::now());
                if let Err(e) = stage.surface.show_panel(*token, &panel) {
                    tracing::warn!("Failed to redraw clock: {}", e);
                }
                stage.timers.arm(TimerSlot::ClockTick, CLOCK_TICK);
            }
            TimerSlot::UnmuteCheck => {
                let Some(Active {
                    token,
                    item: Item::Youtube { .. },
                }) = &self.active
                else {
                    return;
                };
                match stage.surface.foreground_muted() {
                    Ok(true) => {
                        tracing::info!("YouTube player stayed muted");
                        stage.raise(BlockedAction::ForegroundUnmute(*token));
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Could not read player mute state: {}", e),
                }
            }
            TimerSlot::MusicRetry | TimerSlot::ClockOverlay => {}
        }
    }

    pub fn on_media(&mut self, event: MediaEvent, stage: &mut Stage) {
        match event {
            MediaEvent::Started(token) if self.is_current(token) => {
                if matches!(self.active_item(), Some(Item::Youtube { .. })) {
                    self.unmute(stage);
                    stage
                        .timers
                        .arm(TimerSlot::UnmuteCheck, self.settings.unmute_check_delay);
                }
            }
            MediaEvent::Ended(token) if self.is_current(token) => self.advance(stage),
            MediaEvent::Failed(token) if self.is_current(token) => {
                if matches!(self.active_item(), Some(Item::Image { .. })) {
                    tracing::warn!("Image failed to load, advancing");
                    self.advance(stage);
                } else {
                    tracing::warn!("Media failed, advancing after guard delay");
                    stage
                        .timers
                        .arm(TimerSlot::VisualItem, self.settings.error_advance_delay);
                }
            }
            MediaEvent::Started(token) | MediaEvent::Ended(token) | MediaEvent::Failed(token) => {
                tracing::debug!("Ignoring media event for stale {:?}", token);
            }
            MediaEvent::MusicEnded | MediaEvent::MusicFailed => {}
        }
    }

    fn unmute(&mut self, stage: &mut Stage) {
        if let Err(e) = stage.surface.unmute_foreground(self.settings.foreground_volume) {
            tracing::warn!("Failed to unmute player: {}", e);
        }
    }

    /// Replays a blocked unmute after a user gesture, if that item is still
    /// on screen.
    pub fn unmute_after_gesture(&mut self, token: ShowToken, stage: &mut Stage) {
        if self.is_current(token) {
            self.unmute(stage);
        }
    }

    pub fn on_panel(&mut self, token: ShowToken, text: &str, stage: &mut Stage) {
        if !self.is_current(token) {
            return;
        }
        if let Err(e) = stage.surface.show_panel(token, text) {
            tracing::warn!("Failed to update panel: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::testing::{FakeSurface, Shown};
    use crate::widget_sources::testing::FakeSources;
    use crate::widget_sources::WeatherReport;
    use serde_json::json;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Rig {
        engine: PlaybackEngine,
        stage: Stage,
        surface: FakeSurface,
        rx: UnboundedReceiver<PlayerEvent>,
    }

    fn rig_with(sources: FakeSources) -> Rig {
        let (tx, rx) = unbounded_channel();
        let surface = FakeSurface::default();
        let stage = Stage::new(Box::new(surface.clone()), tx);
        let settings = EngineSettings::new(&PlaybackConfig::default(), "https://signage.example.com");
        Rig {
            engine: PlaybackEngine::new(settings, Arc::new(sources)),
            stage,
            surface,
            rx,
        }
    }

    fn rig() -> Rig {
        rig_with(FakeSources::default())
    }

    fn items(value: serde_json::Value) -> Vec<Item> {
        serde_json::from_value(value).unwrap()
    }

    impl Rig {
        /// Lets time pass and feeds whatever fired back into the engine.
        async fn run_for(&mut self, duration: Duration) {
            tokio::time::sleep(duration).await;
            while let Ok(event) = self.rx.try_recv() {
                match event {
                    PlayerEvent::Timer { slot, seq } => {
                        if self.stage.timers.fire(slot, seq) {
                            self.engine.on_timer(slot, &mut self.stage);
                        }
                    }
                    PlayerEvent::Widget(WidgetUpdate::Panel { token, text }) => {
                        self.engine.on_panel(token, &text, &mut self.stage);
                    }
                    PlayerEvent::Media(event) => self.engine.on_media(event, &mut self.stage),
                    _ => {}
                }
            }
        }

        fn token(&self) -> ShowToken {
            self.engine.active_token().unwrap()
        }

        fn last(&self) -> Option<Shown> {
            self.surface.log.lock().unwrap().last().cloned()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_end_advances_to_next_item() {
        let mut rig = rig();
        rig.engine.load(
            items(json!([
                {"type": "image", "url": "a.png", "duration": 5},
                {"type": "video", "url": "b.mp4"},
                {"type": "image", "url": "c.png", "duration": 5}
            ])),
            &mut rig.stage,
        );

        rig.run_for(Duration::from_millis(5100)).await;
        assert_eq!(rig.engine.index(), 1);
        assert!(rig.engine.holds_foreground());

        let video = rig.token();
        rig.engine.on_media(MediaEvent::Ended(video), &mut rig.stage);

        assert_eq!(rig.engine.index(), 2);
        assert!(matches!(rig.last(), Some(Shown::Image(_, url)) if url == "c.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_wraps() {
        let mut rig = rig();
        rig.engine.load(
            items(json!([
                {"type": "image", "url": "a.png", "duration": 2},
                {"type": "image", "url": "b.png", "duration": 2}
            ])),
            &mut rig.stage,
        );
        rig.run_for(Duration::from_millis(2050)).await;
        rig.run_for(Duration::from_millis(2050)).await;
        assert_eq!(rig.engine.index(), 0);
        assert!(matches!(rig.last(), Some(Shown::Image(_, url)) if url == "a.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_reload_keeps_position_and_timer() {
        let mut rig = rig();
        let list = items(json!([
            {"type": "image", "url": "a.png", "duration": 5},
            {"type": "image", "url": "b.png", "duration": 5}
        ]));
        rig.engine.load(list.clone(), &mut rig.stage);
        rig.run_for(Duration::from_millis(5100)).await;
        let token = rig.token();
        let shown = rig.surface.log.lock().unwrap().shown.len();

        rig.run_for(Duration::from_secs(3)).await;
        rig.engine.load(list, &mut rig.stage);
        assert_eq!(rig.token(), token);
        assert_eq!(rig.surface.log.lock().unwrap().shown.len(), shown);

        // The original timer still fires on schedule (5 s after b.png appeared).
        rig.run_for(Duration::from_millis(2100)).await;
        assert_eq!(rig.engine.index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_items_restart_at_first() {
        let mut rig = rig();
        rig.engine.load(
            items(json!([
                {"type": "image", "url": "a.png", "duration": 5},
                {"type": "image", "url": "b.png", "duration": 5}
            ])),
            &mut rig.stage,
        );
        rig.run_for(Duration::from_millis(5100)).await;
        assert_eq!(rig.engine.index(), 1);

        rig.engine.load(
            items(json!([{"type": "image", "url": "z.png", "duration": 5}])),
            &mut rig.stage,
        );
        assert_eq!(rig.engine.index(), 0);
        assert!(matches!(rig.last(), Some(Shown::Image(_, url)) if url == "z.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_video_waits_for_guard_delay() {
        let mut rig = rig();
        rig.engine.load(
            items(json!([
                {"type": "video", "url": "broken.mp4"},
                {"type": "image", "url": "next.png"}
            ])),
            &mut rig.stage,
        );
        let video = rig.token();
        rig.engine.on_media(MediaEvent::Failed(video), &mut rig.stage);
        assert_eq!(rig.engine.index(), 0);

        rig.run_for(Duration::from_millis(50)).await;
        assert_eq!(rig.engine.index(), 0);
        rig.run_for(Duration::from_millis(60)).await;
        assert_eq!(rig.engine.index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_image_advances_immediately() {
        let mut rig = rig();
        rig.engine.load(
            items(json!([
                {"type": "image", "url": "missing.png"},
                {"type": "image", "url": "next.png"}
            ])),
            &mut rig.stage,
        );
        let image = rig.token();
        rig.engine.on_media(MediaEvent::Failed(image), &mut rig.stage);
        assert_eq!(rig.engine.index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_media_events_are_ignored() {
        let mut rig = rig();
        rig.engine.load(
            items(json!([
                {"type": "video", "url": "a.mp4"},
                {"type": "video", "url": "b.mp4"},
                {"type": "video", "url": "c.mp4"}
            ])),
            &mut rig.stage,
        );
        let first = rig.token();
        rig.engine.on_media(MediaEvent::Ended(first), &mut rig.stage);
        rig.engine.on_media(MediaEvent::Ended(first), &mut rig.stage);
        assert_eq!(rig.engine.index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_youtube_and_unknown_types_are_skipped() {
        let mut rig = rig();
        rig.engine.load(
            items(json!([
                {"type": "youtube", "url": "https://example.com/not-youtube"},
                {"type": "hologram", "url": "x"},
                {"type": "image", "url": "ok.png"}
            ])),
            &mut rig.stage,
        );
        rig.run_for(Duration::from_millis(110)).await;
        rig.run_for(Duration::from_millis(110)).await;
        assert_eq!(rig.engine.index(), 2);
        assert!(matches!(rig.last(), Some(Shown::Image(_, url)) if url == "ok.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_youtube_stays_muted_raises_gate_for_that_player() {
        let mut rig = rig();
        rig.surface.log.lock().unwrap().refuse_unmute = true;
        rig.engine.load(
            items(json!([{"type": "youtube", "url": "https://youtu.be/dQw4w9WgXcQ"}])),
            &mut rig.stage,
        );
        let token = rig.token();
        assert!(matches!(rig.last(), Some(Shown::Youtube(_, id)) if id == "dQw4w9WgXcQ"));

        rig.engine.on_media(MediaEvent::Started(token), &mut rig.stage);
        rig.run_for(Duration::from_millis(400)).await;
        assert_eq!(rig.stage.gate.pending(), None);
        rig.run_for(Duration::from_millis(150)).await;
        assert_eq!(
            rig.stage.gate.pending(),
            Some(BlockedAction::ForegroundUnmute(token))
        );
        assert!(rig.surface.log.lock().unwrap().prompt_visible);

        rig.surface.log.lock().unwrap().refuse_unmute = false;
        let Some(BlockedAction::ForegroundUnmute(blocked)) = rig.stage.take_blocked() else {
            panic!("expected a blocked unmute");
        };
        rig.engine.unmute_after_gesture(blocked, &mut rig.stage);
        let log = rig.surface.log.lock().unwrap();
        assert!(!log.foreground_muted);
        assert!(!log.prompt_visible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_youtube_withdraws_its_prompt() {
        let mut rig = rig();
        rig.surface.log.lock().unwrap().refuse_unmute = true;
        rig.engine.load(
            items(json!([
                {"type": "youtube", "url": "dQw4w9WgXcQ"},
                {"type": "image", "url": "a.png"}
            ])),
            &mut rig.stage,
        );
        let token = rig.token();
        rig.engine.on_media(MediaEvent::Started(token), &mut rig.stage);
        rig.run_for(Duration::from_millis(600)).await;
        assert!(rig.surface.log.lock().unwrap().prompt_visible);

        rig.engine.on_media(MediaEvent::Ended(token), &mut rig.stage);
        assert_eq!(rig.stage.gate.pending(), None);
        assert!(!rig.surface.log.lock().unwrap().prompt_visible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_ticks_only_while_shown() {
        let mut rig = rig();
        rig.engine.load(
            items(json!([
                {"type": "clock", "timezone": "UTC", "duration": 3},
                {"type": "image", "url": "a.png", "duration": 30}
            ])),
            &mut rig.stage,
        );
        rig.run_for(Duration::from_millis(1010)).await;
        rig.run_for(Duration::from_millis(1010)).await;
        let panels = |rig: &Rig| {
            rig.surface
                .log
                .lock()
                .unwrap()
                .shown
                .iter()
                .filter(|s| matches!(s, Shown::Panel(..)))
                .count()
        };
        assert_eq!(panels(&rig), 3);
        assert!(rig.stage.timers.is_armed(TimerSlot::ClockTick));

        rig.run_for(Duration::from_millis(1010)).await;
        assert_eq!(rig.engine.index(), 1);
        assert!(!rig.stage.timers.is_armed(TimerSlot::ClockTick));
        let after = panels(&rig);
        rig.run_for(Duration::from_secs(5)).await;
        assert_eq!(panels(&rig), after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_weather_item_renders_fetched_report() {
        let sources = FakeSources::default();
        *sources.weather.lock().unwrap() = Some(WeatherReport {
            place: "Porto".into(),
            temperature_c: 18.4,
            wind_kmh: 12.0,
            code: 0,
        });
        let mut rig = rig_with(sources);
        rig.engine.load(items(json!([{"type": "weather", "location": "Porto"}])), &mut rig.stage);
        rig.run_for(Duration::from_millis(10)).await;

        assert!(matches!(
            rig.last(),
            Some(Shown::Panel(_, text)) if text == "Porto\n18°C  Clear\nWind 12 km/h"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_and_idle_messages() {
        let mut rig = rig();
        rig.engine.load(Vec::new(), &mut rig.stage);
        assert_eq!(rig.last(), Some(Shown::Message(PLAYLIST_EMPTY.to_string())));

        rig.engine.load(items(json!([{"type": "image", "url": "a.png"}])), &mut rig.stage);
        rig.engine.idle(PLAYLIST_NOT_FOUND, &mut rig.stage);
        assert_eq!(rig.engine.active_token(), None);
        assert!(!rig.stage.timers.is_armed(TimerSlot::VisualItem));
        assert_eq!(rig.last(), Some(Shown::Message(PLAYLIST_NOT_FOUND.to_string())));
    }
}
