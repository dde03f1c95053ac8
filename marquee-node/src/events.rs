use serde_json::Value;

use crate::surface::OverlaySlot;

/// Identifies one showing of one visual item. Timers and media events carry
/// the token of the showing they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShowToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Device,
    Group,
    VisualPlaylist,
    MusicPlaylist,
}

impl WatchTarget {
    pub fn collection(self) -> &'static str {
        match self {
            WatchTarget::Device => crate::store::DEVICES,
            WatchTarget::Group => crate::store::GROUPS,
            WatchTarget::VisualPlaylist => crate::store::PLAYLISTS,
            WatchTarget::MusicPlaylist => crate::store::MUSIC_PLAYLISTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    /// Duration timer or error guard of the visual item on screen.
    VisualItem,
    /// Per-second re-render of a clock item.
    ClockTick,
    /// Re-check that a youtube item actually unmuted.
    UnmuteCheck,
    /// Delay before trying the next music track after a failure.
    MusicRetry,
    /// Minute-aligned refresh of the clock overlay.
    ClockOverlay,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// The visual item started rendering (youtube: "started playing").
    Started(ShowToken),
    Ended(ShowToken),
    Failed(ShowToken),
    MusicEnded,
    MusicFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTrack {
    pub index: usize,
    pub media_id: String,
    pub url: String,
}

/// Outcome of one pass over a music playlist.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackLookup {
    Found(ResolvedTrack),
    /// Every id was missing or unplayable.
    NothingPlayable,
    /// The store could not be asked about the track at `index`.
    StoreUnavailable { index: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WidgetUpdate {
    Overlay {
        slot: OverlaySlot,
        seq: u64,
        text: Option<String>,
    },
    /// Fetched content for a panel item (weather) that is on screen.
    Panel { token: ShowToken, text: String },
}

/// Everything the session loop reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Snapshot {
        target: WatchTarget,
        generation: u64,
        document: Option<Value>,
    },
    Timer {
        slot: TimerSlot,
        seq: u64,
    },
    Media(MediaEvent),
    MusicResolved {
        seq: u64,
        lookup: TrackLookup,
    },
    Widget(WidgetUpdate),
    UserGesture,
    Shutdown,
}
