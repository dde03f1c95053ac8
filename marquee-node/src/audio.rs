use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::events::{PlayerEvent, ResolvedTrack, ShowToken, TimerSlot, TrackLookup};
use crate::model::MediaRecord;
use crate::stage::Stage;
use crate::store::{DocumentStore, MEDIA};
use crate::surface::{AudioChannel, PlayError, Playing, VisualSurface};

/// An action the platform refused to make audible until a user gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedAction {
    Music,
    ForegroundUnmute(ShowToken),
}

/// The single enable-audio affordance. Holds at most one pending action; the
/// most recently blocked one wins.
#[derive(Debug, Default)]
pub struct AudioGate {
    pending: Option<BlockedAction>,
}

fn show_prompt(surface: &mut dyn VisualSurface, visible: bool) {
    if let Err(e) = surface.set_audio_prompt(visible) {
        tracing::warn!("Failed to toggle the enable-audio prompt: {}", e);
    }
}

impl AudioGate {
    pub fn pending(&self) -> Option<BlockedAction> {
        self.pending
    }

    pub fn raise(&mut self, action: BlockedAction, surface: &mut dyn VisualSurface) {
        if let Some(previous) = self.pending.replace(action) {
            if previous != action {
                tracing::debug!("{:?} replaces pending {:?}", action, previous);
            }
        }
        tracing::info!("Audio blocked until a user gesture ({:?})", action);
        show_prompt(surface, true);
    }

    /// Drops `action` if it is the pending one.
    pub fn withdraw(&mut self, action: BlockedAction, surface: &mut dyn VisualSurface) {
        if self.pending == Some(action) {
            self.pending = None;
            show_prompt(surface, false);
        }
    }

    pub fn take(&mut self, surface: &mut dyn VisualSurface) -> Option<BlockedAction> {
        let action = self.pending.take();
        if action.is_some() {
            show_prompt(surface, false);
        }
        action
    }
}

/// Resolves the first playable track starting at `start`, visiting each id
/// at most once. A store error ends the pass at the id it happened on.
pub async fn find_playable(
    store: &dyn DocumentStore,
    items: &[String],
    start: usize,
) -> TrackLookup {
    for offset in 0..items.len() {
        let index = (start + offset) % items.len();
        let media_id = &items[index];

        match store.get(MEDIA, media_id).await {
            Ok(Some(document)) => match serde_json::from_value::<MediaRecord>(document) {
                Ok(record) if !record.url.trim().is_empty() => {
                    return TrackLookup::Found(ResolvedTrack {
                        index,
                        media_id: media_id.clone(),
                        url: record.url,
                    });
                }
                Ok(_) => tracing::warn!("Music track {} has no url, skipping", media_id),
                Err(e) => tracing::warn!("Music track {} is malformed, skipping: {}", media_id, e),
            },
            Ok(None) => tracing::info!("Music track {} no longer exists, skipping", media_id),
            Err(e) => {
                tracing::warn!("Could not resolve music track {}: {}", media_id, e);
                return TrackLookup::StoreUnavailable { index };
            }
        }
    }
    TrackLookup::NothingPlayable
}

/// Background music rotation over one shared channel, paused while the
/// visual side holds foreground media.
pub struct AudioDuckingController {
    channel: Box<dyn AudioChannel>,
    store: Arc<dyn DocumentStore>,
    events: UnboundedSender<PlayerEvent>,
    items: Option<Vec<String>>,
    index: usize,
    current: Option<ResolvedTrack>,
    ducked: bool,
    resolve_seq: u64,
    retry_delay: Duration,
    /// The armed retry asks for the same index again instead of the next.
    retry_in_place: bool,
}

impl AudioDuckingController {
    pub fn new(
        mut channel: Box<dyn AudioChannel>,
        store: Arc<dyn DocumentStore>,
        events: UnboundedSender<PlayerEvent>,
        volume: f64,
        retry_delay: Duration,
    ) -> Self {
        if let Err(e) = channel.set_volume(volume) {
            tracing::warn!("Failed to set music volume: {}", e);
        }
        Self {
            channel,
            store,
            events,
            items: None,
            index: 0,
            current: None,
            ducked: false,
            resolve_seq: 0,
            retry_delay,
            retry_in_place: false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.channel.is_playing()
    }

    pub fn current_track(&self) -> Option<&ResolvedTrack> {
        self.current.as_ref()
    }

    /// Stops the rotation and forgets the playlist.
    pub fn clear(&mut self, stage: &mut Stage) {
        if self.items.is_none() && self.current.is_none() {
            return;
        }
        tracing::info!("Music stopped");
        self.items = None;
        self.stop_track(stage);
        self.index = 0;
    }

    fn stop_track(&mut self, stage: &mut Stage) {
        self.resolve_seq += 1;
        self.current = None;
        self.retry_in_place = false;
        stage.timers.cancel(TimerSlot::MusicRetry);
        stage.withdraw(BlockedAction::Music);
        if let Err(e) = self.channel.stop() {
            tracing::warn!("Failed to stop music channel: {}", e);
        }
    }

    /// Installs the track list of the watched music playlist. A track that is
    /// already playing keeps playing; the new list takes over at the next
    /// advance. An unchanged list only restarts resolution when nothing is
    /// loaded.
    pub fn set_items(&mut self, items: Vec<String>, stage: &mut Stage) {
        if self.items.as_ref() == Some(&items) {
            if self.current.is_none() && !items.is_empty() {
                stage.timers.cancel(TimerSlot::MusicRetry);
                self.retry_in_place = false;
                self.request_next();
            }
            return;
        }

        if items.is_empty() {
            tracing::info!("Music playlist is empty");
            self.stop_track(stage);
            self.items = Some(items);
            self.index = 0;
            return;
        }

        let idle = self.current.is_none();
        self.index = if idle { 0 } else { self.index.min(items.len() - 1) };
        self.items = Some(items);
        if idle {
            self.request_next();
        }
    }

    fn request_next(&mut self) {
        let Some(items) = self.items.clone().filter(|items| !items.is_empty()) else {
            return;
        };
        self.resolve_seq += 1;
        let seq = self.resolve_seq;
        let start = self.index % items.len();
        let store = Arc::clone(&self.store);
        let events = self.events.clone();

        tokio::spawn(async move {
            let lookup = find_playable(store.as_ref(), &items, start).await;
            let _ = events.send(PlayerEvent::MusicResolved { seq, lookup });
        });
    }

    pub fn on_resolved(&mut self, seq: u64, lookup: TrackLookup, stage: &mut Stage) {
        if seq != self.resolve_seq {
            return;
        }
        self.retry_in_place = false;
        let track = match lookup {
            TrackLookup::Found(track) => track,
            TrackLookup::NothingPlayable => {
                tracing::warn!("No playable music in the playlist, staying silent");
                self.stop_track(stage);
                return;
            }
            TrackLookup::StoreUnavailable { index } => {
                tracing::warn!("Music store unavailable, retrying track {}", index);
                self.index = index;
                self.retry_in_place = true;
                stage.timers.arm(TimerSlot::MusicRetry, self.retry_delay);
                return;
            }
        };

        tracing::info!("Music track {} ({})", track.media_id, track.url);
        self.index = track.index;
        if let Err(e) = self.channel.load(&track.url) {
            tracing::warn!("Failed to load music track {}: {}", track.media_id, e);
            self.current = None;
            stage.timers.arm(TimerSlot::MusicRetry, self.retry_delay);
            return;
        }
        self.current = Some(track);
        if !self.ducked {
            self.start(stage);
        }
    }

    fn start(&mut self, stage: &mut Stage) {
        match self.channel.attempt_play() {
            Ok(Playing) => stage.withdraw(BlockedAction::Music),
            Err(PlayError::Blocked) => stage.raise(BlockedAction::Music),
            Err(PlayError::Failed(reason)) => {
                tracing::warn!("Music track failed to start: {}", reason);
                stage.timers.arm(TimerSlot::MusicRetry, self.retry_delay);
            }
        }
    }

    /// Pauses or resumes music so that it is never audible while the visual
    /// side holds foreground media.
    pub fn reconcile(&mut self, foreground_active: bool, stage: &mut Stage) {
        if foreground_active == self.ducked {
            return;
        }
        self.ducked = foreground_active;

        if foreground_active {
            if let Err(e) = self.channel.pause() {
                tracing::warn!("Failed to pause music: {}", e);
            }
        } else if self.current.is_some() {
            self.start(stage);
        }
    }

    pub fn resume_after_gesture(&mut self, stage: &mut Stage) {
        if self.current.is_some() && !self.ducked && !self.channel.is_playing() {
            self.start(stage);
        }
    }

    pub fn on_track_ended(&mut self) {
        if self.current.take().is_some() {
            self.index += 1;
            self.request_next();
        }
    }

    pub fn on_track_failed(&mut self, stage: &mut Stage) {
        if let Some(track) = self.current.take() {
            tracing::warn!("Music track {} failed during playback", track.media_id);
            stage.timers.arm(TimerSlot::MusicRetry, self.retry_delay);
        }
    }

    pub fn on_retry(&mut self) {
        self.current = None;
        if !std::mem::take(&mut self.retry_in_place) {
            self.index += 1;
        }
        self.request_next();
    }

    pub fn shutdown(&mut self) {
        self.resolve_seq += 1;
        self.items = None;
        self.current = None;
        if let Err(e) = self.channel.stop() {
            tracing::warn!("Failed to stop music channel: {}", e);
        }
    }
}

/// Track ids of a music playlist document. Malformed documents have none.
pub fn media_ids(document: &Value) -> Vec<String> {
    serde_json::from_value::<crate::model::MusicPlaylist>(document.clone())
        .map(|playlist| playlist.items)
        .unwrap_or_default()
}
