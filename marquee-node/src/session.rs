use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::{media_ids, AudioDuckingController, BlockedAction};
use crate::config::Config;
use crate::events::{MediaEvent, PlayerEvent, TimerSlot, WatchTarget, WidgetUpdate};
use crate::heartbeat::HeartbeatManager;
use crate::model::{Device, Group, VisualPlaylist};
use crate::playback::{EngineSettings, PlaybackEngine, NO_PLAYLIST, PLAYLIST_NOT_FOUND};
use crate::schedule::{EffectivePlaylists, ScheduleResolver};
use crate::stage::Stage;
use crate::store::DocumentStore;
use crate::surface::{AudioChannel, OverlaySlot, VisualSurface};
use crate::watcher::Watcher;
use crate::widget_sources::WidgetSources;
use crate::widgets::WidgetOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The device record is gone or no longer paired.
    Unpaired,
    Shutdown,
}

/// Where a session renders and fetches.
pub struct Outputs {
    pub surface: Box<dyn VisualSurface>,
    pub audio: Box<dyn AudioChannel>,
    pub sources: Arc<dyn WidgetSources>,
}

fn every(period: Duration) -> Interval {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

fn clean(id: Option<&String>) -> Option<String> {
    id.map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// One paired run of the player. Owns every watcher, timer and media
/// handle; all state changes happen on the task running `run`.
pub struct Session {
    device_id: String,
    store: Arc<dyn DocumentStore>,
    events: UnboundedSender<PlayerEvent>,
    inbox: UnboundedReceiver<PlayerEvent>,
    resolver: ScheduleResolver,
    stage: Stage,
    engine: PlaybackEngine,
    music: AudioDuckingController,
    widgets: WidgetOrchestrator,
    device_watch: Watcher,
    group_watch: Watcher,
    visual_watch: Watcher,
    music_watch: Watcher,
    device: Option<Device>,
    group: Option<Group>,
    /// False while a group subscription has not delivered its first snapshot.
    group_loaded: bool,
    effective: EffectivePlaylists,
    recheck_period: Duration,
    heartbeat_period: Duration,
}

impl Session {
    pub fn new(
        config: &Config,
        device_id: String,
        store: Arc<dyn DocumentStore>,
        outputs: Outputs,
        events: UnboundedSender<PlayerEvent>,
        inbox: UnboundedReceiver<PlayerEvent>,
    ) -> Self {
        let stage = Stage::new(outputs.surface, events.clone());
        let engine = PlaybackEngine::new(
            EngineSettings::new(&config.playback, &config.viewer_base_url),
            Arc::clone(&outputs.sources),
        );
        let music = AudioDuckingController::new(
            outputs.audio,
            Arc::clone(&store),
            events.clone(),
            config.playback.music_volume,
            config.playback.music_retry_delay(),
        );
        let widgets = WidgetOrchestrator::new(
            outputs.sources,
            config.widgets.clone(),
            config.viewer_base_url.clone(),
        );

        Self {
            device_id,
            store,
            events,
            inbox,
            resolver: ScheduleResolver::new(config.timezone.as_deref()),
            stage,
            engine,
            music,
            widgets,
            device_watch: Watcher::new(WatchTarget::Device),
            group_watch: Watcher::new(WatchTarget::Group),
            visual_watch: Watcher::new(WatchTarget::VisualPlaylist),
            music_watch: Watcher::new(WatchTarget::MusicPlaylist),
            device: None,
            group: None,
            group_loaded: true,
            effective: EffectivePlaylists::default(),
            recheck_period: Duration::from_secs(config.schedule_recheck_secs.max(1)),
            heartbeat_period: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        }
    }

    #[cfg(test)]
    fn with_resolver(mut self, resolver: ScheduleResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> SessionEnd {
        tracing::info!("Session started for device {}", self.device_id);

        let heartbeat_cancel = shutdown.child_token();
        let heartbeat = HeartbeatManager::new(
            Arc::clone(&self.store),
            self.device_id.clone(),
            self.heartbeat_period,
        );
        tokio::spawn(heartbeat.start(heartbeat_cancel.clone()));

        let device_id = self.device_id.clone();
        self.device_watch
            .watch(self.store.as_ref(), Some(device_id.as_str()), &self.events);

        let mut recheck = every(self.recheck_period);
        let mut weather = every(self.refresh_period(OverlaySlot::Weather));
        let mut news = every(self.refresh_period(OverlaySlot::News));
        let mut currency = every(self.refresh_period(OverlaySlot::Currency));

        let end = loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => Some(SessionEnd::Shutdown),
                event = self.inbox.recv() => match event {
                    Some(event) => self.handle(event),
                    None => Some(SessionEnd::Shutdown),
                },
                _ = recheck.tick() => {
                    self.apply_resolution();
                    None
                }
                _ = weather.tick() => {
                    self.widgets.refresh(OverlaySlot::Weather, &mut self.stage);
                    None
                }
                _ = news.tick() => {
                    self.widgets.refresh(OverlaySlot::News, &mut self.stage);
                    None
                }
                _ = currency.tick() => {
                    self.widgets.refresh(OverlaySlot::Currency, &mut self.stage);
                    None
                }
            };

            if let Some(end) = outcome {
                break end;
            }
            self.music
                .reconcile(self.engine.holds_foreground(), &mut self.stage);
        };

        heartbeat_cancel.cancel();
        self.teardown();
        tracing::info!("Session for device {} ended: {:?}", self.device_id, end);
        end
    }

    fn refresh_period(&self, slot: OverlaySlot) -> Duration {
        self.widgets
            .refresh_interval(slot)
            .unwrap_or(Duration::from_secs(3600))
    }

    fn handle(&mut self, event: PlayerEvent) -> Option<SessionEnd> {
        match event {
            PlayerEvent::Snapshot {
                target,
                generation,
                document,
            } => return self.on_snapshot(target, generation, document),
            PlayerEvent::Timer { slot, seq } => {
                if !self.stage.timers.fire(slot, seq) {
                    return None;
                }
                match slot {
                    TimerSlot::VisualItem | TimerSlot::ClockTick | TimerSlot::UnmuteCheck => {
                        self.engine.on_timer(slot, &mut self.stage)
                    }
                    TimerSlot::MusicRetry => self.music.on_retry(),
                    TimerSlot::ClockOverlay => self.widgets.on_clock_tick(&mut self.stage),
                }
            }
            PlayerEvent::Media(MediaEvent::MusicEnded) => self.music.on_track_ended(),
            PlayerEvent::Media(MediaEvent::MusicFailed) => {
                self.music.on_track_failed(&mut self.stage)
            }
            PlayerEvent::Media(event) => self.engine.on_media(event, &mut self.stage),
            PlayerEvent::MusicResolved { seq, lookup } => {
                self.music.on_resolved(seq, lookup, &mut self.stage)
            }
            PlayerEvent::Widget(WidgetUpdate::Overlay { slot, seq, text }) => {
                self.widgets.on_update(slot, seq, text, &mut self.stage)
            }
            PlayerEvent::Widget(WidgetUpdate::Panel { token, text }) => {
                self.engine.on_panel(token, &text, &mut self.stage)
            }
            PlayerEvent::UserGesture => match self.stage.take_blocked() {
                Some(BlockedAction::Music) => self.music.resume_after_gesture(&mut self.stage),
                Some(BlockedAction::ForegroundUnmute(token)) => {
                    self.engine.unmute_after_gesture(token, &mut self.stage)
                }
                None => {}
            },
            PlayerEvent::Shutdown => return Some(SessionEnd::Shutdown),
        }
        None
    }

    fn on_snapshot(
        &mut self,
        target: WatchTarget,
        generation: u64,
        document: Option<Value>,
    ) -> Option<SessionEnd> {
        let live = match target {
            WatchTarget::Device => self.device_watch.accepts(generation),
            WatchTarget::Group => self.group_watch.accepts(generation),
            WatchTarget::VisualPlaylist => self.visual_watch.accepts(generation),
            WatchTarget::MusicPlaylist => self.music_watch.accepts(generation),
        };
        if !live {
            tracing::debug!("Dropping stale {:?} snapshot", target);
            return None;
        }

        match target {
            WatchTarget::Device => {
                let Some(document) = document else {
                    tracing::warn!("Device {} was deleted", self.device_id);
                    return Some(SessionEnd::Unpaired);
                };
                match serde_json::from_value::<Device>(document) {
                    Ok(device) if !device.is_paired => {
                        tracing::warn!("Device {} was unpaired", self.device_id);
                        return Some(SessionEnd::Unpaired);
                    }
                    Ok(device) => self.on_device(device),
                    Err(e) => tracing::warn!("Ignoring malformed device record: {}", e),
                }
            }
            WatchTarget::Group => {
                self.group_loaded = true;
                self.group = document.and_then(|doc| match serde_json::from_value::<Group>(doc) {
                    Ok(group) => Some(group),
                    Err(e) => {
                        tracing::warn!("Ignoring malformed group record: {}", e);
                        None
                    }
                });
                self.apply_resolution();
            }
            WatchTarget::VisualPlaylist => {
                let playlist = document.map(serde_json::from_value::<VisualPlaylist>);
                match playlist {
                    Some(Ok(playlist)) => self.engine.load(playlist.items, &mut self.stage),
                    Some(Err(e)) => {
                        tracing::warn!("Visual playlist is malformed: {}", e);
                        self.engine.idle(PLAYLIST_NOT_FOUND, &mut self.stage);
                    }
                    None => {
                        tracing::warn!(
                            "Visual playlist {} not found",
                            self.visual_watch.current_id().unwrap_or_default()
                        );
                        self.engine.idle(PLAYLIST_NOT_FOUND, &mut self.stage);
                    }
                }
            }
            WatchTarget::MusicPlaylist => match document {
                Some(document) => self.music.set_items(media_ids(&document), &mut self.stage),
                None => {
                    tracing::warn!(
                        "Music playlist {} not found",
                        self.music_watch.current_id().unwrap_or_default()
                    );
                    self.music.clear(&mut self.stage);
                }
            },
        }
        None
    }

    fn on_device(&mut self, device: Device) {
        self.widgets.apply(&device, &self.device_id, &mut self.stage);
        self.engine
            .set_weather_fallback(clean(device.weather_widget.location.as_ref()));

        let group_id = if device.managed_by_group {
            clean(device.group_id.as_ref())
        } else {
            None
        };
        if self
            .group_watch
            .watch(self.store.as_ref(), group_id.as_deref(), &self.events)
        {
            self.group = None;
            self.group_loaded = group_id.is_none();
        }

        self.device = Some(device);
        self.apply_resolution();
    }

    /// Resolves the effective playlists and moves each axis to its new
    /// target. An unchanged id leaves that axis alone; a changed one is torn
    /// down completely before the new subscription opens.
    fn apply_resolution(&mut self) {
        let Some(device) = &self.device else {
            return;
        };
        if !self.group_loaded {
            tracing::debug!("Waiting for the group record before resolving");
            return;
        }
        let group = self
            .group
            .as_ref()
            .filter(|group| group.contains(&self.device_id));
        if device.managed_by_group && self.group.is_some() && group.is_none() {
            tracing::debug!("Group does not list {}, using mirrored fields", self.device_id);
        }
        let next = self.resolver.resolve(device, group);

        if next != self.effective {
            tracing::info!(
                "Effective playlists: visual={:?} music={:?}",
                next.visual,
                next.music
            );
        }

        if self.visual_watch.current_id() != next.visual.as_deref() {
            self.engine.reset(&mut self.stage);
            self.visual_watch
                .watch(self.store.as_ref(), next.visual.as_deref(), &self.events);
        }
        if next.visual.is_none() {
            self.engine.idle(NO_PLAYLIST, &mut self.stage);
        }

        if self.music_watch.current_id() != next.music.as_deref() {
            self.music.clear(&mut self.stage);
            self.music_watch
                .watch(self.store.as_ref(), next.music.as_deref(), &self.events);
        }

        self.effective = next;
    }

    fn teardown(&mut self) {
        self.device_watch.cancel();
        self.group_watch.cancel();
        self.visual_watch.cancel();
        self.music_watch.cancel();
        self.engine.reset(&mut self.stage);
        self.music.shutdown();
        self.widgets.clear(&mut self.stage);
        self.stage.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{DEVICES, GROUPS, MEDIA, MUSIC_PLAYLISTS, PLAYLISTS};
    use crate::surface::testing::{FakeAudio, FakeSurface, Shown};
    use crate::widget_sources::testing::FakeSources;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::task::JoinHandle;

    struct Harness {
        store: MemoryStore,
        surface: FakeSurface,
        audio: FakeAudio,
        events: UnboundedSender<PlayerEvent>,
        shutdown: CancellationToken,
        task: JoinHandle<SessionEnd>,
    }

    fn config() -> Config {
        toml::from_str(Config::default_template()).unwrap()
    }

    fn start(store: MemoryStore) -> Harness {
        launch(store, None)
    }

    fn launch(store: MemoryStore, resolver: Option<ScheduleResolver>) -> Harness {
        let surface = FakeSurface::default();
        let audio = FakeAudio::default();
        let (events, inbox) = unbounded_channel();
        let outputs = Outputs {
            surface: Box::new(surface.clone()),
            audio: Box::new(audio.clone()),
            sources: Arc::new(FakeSources::default()),
        };
        let mut session = Session::new(
            &config(),
            "dev1".to_string(),
            Arc::new(store.clone()),
            outputs,
            events.clone(),
            inbox,
        );
        if let Some(resolver) = resolver {
            session = session.with_resolver(resolver);
        }
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(session.run(shutdown.clone()));
        Harness {
            store,
            surface,
            audio,
            events,
            shutdown,
            task,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    impl Harness {
        fn last(&self) -> Option<Shown> {
            self.surface.log.lock().unwrap().last().cloned()
        }

        fn shown(&self) -> Vec<Shown> {
            self.surface.log.lock().unwrap().shown.clone()
        }

        fn music_playing(&self) -> bool {
            self.audio.log.lock().unwrap().playing
        }

        fn send(&self, event: PlayerEvent) {
            self.events.send(event).unwrap();
        }

        fn update_device(&self, fields: Value) {
            let mut doc = self.store.document(DEVICES, "dev1").unwrap();
            for (key, value) in fields.as_object().unwrap() {
                doc[key] = value.clone();
            }
            self.store.put(DEVICES, "dev1", doc);
        }
    }

    fn paired_device(fields: Value) -> Value {
        let mut doc = json!({"name": "Lobby", "isPaired": true});
        for (key, value) in fields.as_object().unwrap() {
            doc[key] = value.clone();
        }
        doc
    }

    fn images(urls: &[&str], secs: u64) -> Value {
        let items: Vec<Value> = urls
            .iter()
            .map(|url| json!({"type": "image", "url": url, "duration": secs}))
            .collect();
        json!({"name": "Images", "items": items})
    }

    fn is_image(shown: &Option<Shown>, expected: &str) -> bool {
        matches!(shown, Some(Shown::Image(_, url)) if url == expected)
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_end_continues_with_following_item() {
        let store = MemoryStore::new();
        store.put(DEVICES, "dev1", paired_device(json!({"playlistId": "p1"})));
        store.put(
            PLAYLISTS,
            "p1",
            json!({"items": [
                {"type": "image", "url": "a.png", "duration": 5},
                {"type": "video/mp4", "url": "b.mp4"},
                {"type": "image", "url": "c.png", "duration": 5}
            ]}),
        );
        let h = start(store);
        settle().await;
        assert!(is_image(&h.last(), "a.png"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let Some(Shown::Video(token, url, muted)) = h.last() else {
            panic!("expected the video, got {:?}", h.last());
        };
        assert_eq!(url, "b.mp4");
        assert!(!muted);

        h.send(PlayerEvent::Media(MediaEvent::Ended(token)));
        settle().await;
        assert!(is_image(&h.last(), "c.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_playlist_shows_message_and_stops_rotation() {
        let store = MemoryStore::new();
        store.put(DEVICES, "dev1", paired_device(json!({"playlistId": "p1"})));
        store.put(PLAYLISTS, "p1", images(&["a.png", "b.png"], 5));
        let h = start(store);
        settle().await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.store.delete(PLAYLISTS, "p1");
        settle().await;
        assert_eq!(h.last(), Some(Shown::Message("Playlist not found".to_string())));

        let count = h.shown().len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.shown().len(), count);

        // Still listening: the playlist coming back resumes playback.
        h.store.put(PLAYLISTS, "p1", images(&["c.png"], 5));
        settle().await;
        assert!(is_image(&h.last(), "c.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_youtube_prompt_and_gesture_touch_only_the_player() {
        let store = MemoryStore::new();
        store.put(
            DEVICES,
            "dev1",
            paired_device(json!({"playlistId": "p1", "musicPlaylistId": "m1"})),
        );
        store.put(
            PLAYLISTS,
            "p1",
            json!({"items": [{"type": "youtube", "url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=3"}]}),
        );
        store.put(MUSIC_PLAYLISTS, "m1", json!({"items": ["t1"]}));
        store.put(MEDIA, "t1", json!({"url": "t1.mp3"}));
        let h = start(store);
        h.surface.log.lock().unwrap().refuse_unmute = true;
        settle().await;

        let Some(Shown::Youtube(token, id)) = h.last() else {
            panic!("expected the youtube item, got {:?}", h.last());
        };
        assert_eq!(id, "dQw4w9WgXcQ");
        assert!(!h.music_playing());
        let volumes_before = h.audio.log.lock().unwrap().volume_changes.clone();

        h.send(PlayerEvent::Media(MediaEvent::Started(token)));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(h.surface.log.lock().unwrap().prompt_visible);

        h.surface.log.lock().unwrap().refuse_unmute = false;
        h.send(PlayerEvent::UserGesture);
        settle().await;

        let log = h.surface.log.lock().unwrap();
        assert!(!log.foreground_muted);
        assert!(!log.prompt_visible);
        assert_eq!(log.unmute_calls, 2);
        drop(log);
        assert_eq!(h.audio.log.lock().unwrap().volume_changes, volumes_before);
        assert!(!h.music_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_music_is_silent_during_foreground_media() {
        let store = MemoryStore::new();
        store.put(
            DEVICES,
            "dev1",
            paired_device(json!({"playlistId": "p1", "musicPlaylistId": "m1"})),
        );
        store.put(
            PLAYLISTS,
            "p1",
            json!({"items": [
                {"type": "image", "url": "a.png", "duration": 2},
                {"type": "video", "url": "b.mp4"},
                {"type": "iframe", "url": "https://menu.example.com", "duration": 4}
            ]}),
        );
        store.put(MUSIC_PLAYLISTS, "m1", json!({"items": ["t1"]}));
        store.put(MEDIA, "t1", json!({"url": "t1.mp3"}));
        let h = start(store);
        settle().await;
        assert!(h.music_playing());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let Some(Shown::Video(token, ..)) = h.last() else {
            panic!("expected the video, got {:?}", h.last());
        };
        assert!(!h.music_playing());

        h.send(PlayerEvent::Media(MediaEvent::Ended(token)));
        settle().await;
        assert!(matches!(h.last(), Some(Shown::WebPage(..))));
        assert!(!h.music_playing());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(is_image(&h.last(), "a.png"));
        assert!(h.music_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_noop_device_push_keeps_rotation() {
        let store = MemoryStore::new();
        store.put(DEVICES, "dev1", paired_device(json!({"playlistId": "p1"})));
        store.put(PLAYLISTS, "p1", images(&["a.png", "b.png"], 5));
        let h = start(store);
        settle().await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let count = h.shown().len();
        h.update_device(json!({"name": "Lobby (renamed)"}));
        settle().await;
        assert_eq!(h.shown().len(), count);

        // b.png still appears 5 s after a.png, not 5 s after the push.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(is_image(&h.last(), "b.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_playlist_id_restarts_at_first_item() {
        let store = MemoryStore::new();
        store.put(DEVICES, "dev1", paired_device(json!({"playlistId": "p1"})));
        store.put(PLAYLISTS, "p1", images(&["a.png", "b.png"], 5));
        store.put(PLAYLISTS, "p2", images(&["x.png", "y.png"], 5));
        let h = start(store);
        settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(is_image(&h.last(), "b.png"));

        h.update_device(json!({"playlistId": "p2"}));
        settle().await;
        assert!(is_image(&h.last(), "x.png"));
        assert_eq!(h.store.subscriber_count(PLAYLISTS, "p1"), 0);
        assert_eq!(h.store.subscriber_count(PLAYLISTS, "p2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unassigned_visual_playlist_shows_message() {
        let store = MemoryStore::new();
        store.put(DEVICES, "dev1", paired_device(json!({})));
        let h = start(store);
        settle().await;
        assert_eq!(h.last(), Some(Shown::Message("No visual playlist assigned".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_data_shadows_device_fields() {
        let store = MemoryStore::new();
        store.put(
            DEVICES,
            "dev1",
            paired_device(json!({"managedByGroup": true, "groupId": "g1", "playlistId": "own"})),
        );
        store.put(GROUPS, "g1", json!({"screens": ["dev1"], "playlistId": "shared"}));
        store.put(PLAYLISTS, "own", images(&["own.png"], 5));
        store.put(PLAYLISTS, "shared", images(&["shared.png"], 5));
        let h = start(store);
        settle().await;
        assert!(is_image(&h.last(), "shared.png"));

        h.update_device(json!({"playlistId": "other"}));
        settle().await;
        assert!(is_image(&h.last(), "shared.png"));
        assert_eq!(h.store.subscriber_count(PLAYLISTS, "shared"), 1);

        // Dropped from the group's screen list: the mirrored fields apply.
        h.store.put(GROUPS, "g1", json!({"screens": [], "playlistId": "shared"}));
        h.update_device(json!({"playlistId": "own"}));
        settle().await;
        assert!(is_image(&h.last(), "own.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_managed_device_waits_for_its_group() {
        let store = MemoryStore::new();
        store.put(
            DEVICES,
            "dev1",
            paired_device(json!({"managedByGroup": true, "groupId": "g1", "playlistId": "own"})),
        );
        store.put(GROUPS, "g1", json!({"screens": ["dev1"], "playlistId": "shared"}));
        store.put(GROUPS, "g2", json!({"screens": ["dev1"], "playlistId": "other"}));
        store.put(PLAYLISTS, "own", images(&["own.png"], 5));
        store.put(PLAYLISTS, "shared", images(&["shared.png"], 5));
        store.put(PLAYLISTS, "other", images(&["other.png"], 5));
        let h = start(store);
        settle().await;
        assert!(is_image(&h.last(), "shared.png"));

        h.update_device(json!({"groupId": "g2"}));
        settle().await;
        assert!(is_image(&h.last(), "other.png"));

        let own_shown = h
            .shown()
            .iter()
            .any(|shown| matches!(shown, Shown::Image(_, url) if url == "own.png"));
        assert!(!own_shown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_group_falls_back_to_device_fields() {
        let store = MemoryStore::new();
        store.put(
            DEVICES,
            "dev1",
            paired_device(json!({"managedByGroup": true, "groupId": "gone", "playlistId": "own"})),
        );
        store.put(PLAYLISTS, "own", images(&["own.png"], 5));
        let h = start(store);
        settle().await;
        assert!(is_image(&h.last(), "own.png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_window_opening_switches_on_recheck() {
        let store = MemoryStore::new();
        store.put(
            DEVICES,
            "dev1",
            paired_device(json!({
                "playlistId": "p1",
                "visualSchedulingMode": "ADVANCED",
                "visualScheduleRules": [
                    {"days": [2], "startTime": "09:00", "endTime": "12:00", "playlistId": "p2"}
                ]
            })),
        );
        store.put(PLAYLISTS, "p1", images(&["a.png", "b.png"], 5));
        store.put(PLAYLISTS, "p2", images(&["x.png", "y.png"], 5));

        // Tuesday 08:59:30, advancing with the paused tokio clock.
        let base = chrono::NaiveDate::from_ymd_opt(2026, 10, 20)
            .unwrap()
            .and_hms_opt(8, 59, 30)
            .unwrap();
        let origin = Instant::now();
        let clock: crate::schedule::Clock = Arc::new(move || {
            base + chrono::Duration::from_std(origin.elapsed()).unwrap()
        });
        let h = launch(store, Some(ScheduleResolver::with_clock(clock)));
        settle().await;
        assert!(is_image(&h.last(), "a.png"));

        // The window is open from 30 s on, but nothing is pushed until the
        // next re-check at 60 s.
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(matches!(h.last(), Some(Shown::Image(_, url)) if url == "a.png" || url == "b.png"));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(is_image(&h.last(), "x.png"));
        assert_eq!(h.store.subscriber_count(PLAYLISTS, "p1"), 0);
        assert_eq!(h.store.subscriber_count(PLAYLISTS, "p2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_item_duration_keeps_the_player_running() {
        let store = MemoryStore::new();
        store.put(DEVICES, "dev1", paired_device(json!({"playlistId": "p1"})));
        store.put(
            PLAYLISTS,
            "p1",
            json!({"items": [{"type": "image", "url": "a.png", "duration": 1e30}]}),
        );
        let h = start(store);
        settle().await;
        assert!(is_image(&h.last(), "a.png"));

        h.shutdown.cancel();
        assert_eq!(h.task.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_device_releases_everything() {
        let store = MemoryStore::new();
        store.put(
            DEVICES,
            "dev1",
            paired_device(json!({"playlistId": "p1", "musicPlaylistId": "m1"})),
        );
        store.put(PLAYLISTS, "p1", images(&["a.png"], 5));
        store.put(MUSIC_PLAYLISTS, "m1", json!({"items": ["t1"]}));
        store.put(MEDIA, "t1", json!({"url": "t1.mp3"}));
        let h = start(store);
        settle().await;
        assert!(h.music_playing());

        h.store.delete(DEVICES, "dev1");
        let end = h.task.await.unwrap();
        assert_eq!(end, SessionEnd::Unpaired);
        assert_eq!(h.store.total_subscribers(), 0);
        assert!(!h.audio.log.lock().unwrap().playing);
        assert_eq!(h.surface.log.lock().unwrap().last(), Some(&Shown::Cleared));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_token_ends_session() {
        let store = MemoryStore::new();
        store.put(DEVICES, "dev1", paired_device(json!({"playlistId": "p1"})));
        let h = start(store);
        settle().await;
        h.shutdown.cancel();
        assert_eq!(h.task.await.unwrap(), SessionEnd::Shutdown);
    }
}
