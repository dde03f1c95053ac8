use anyhow::Result;

use crate::events::ShowToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OverlaySlot {
    Clock,
    Weather,
    News,
    Currency,
    Qr,
}

impl OverlaySlot {
    pub const ALL: [OverlaySlot; 5] = [
        OverlaySlot::Clock,
        OverlaySlot::Weather,
        OverlaySlot::News,
        OverlaySlot::Currency,
        OverlaySlot::Qr,
    ];
}

/// Proof that a channel is audible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Playing;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlayError {
    /// The platform refuses audible playback until someone interacts with
    /// the device.
    #[error("playback blocked until a user gesture")]
    Blocked,
    #[error("playback failed: {0}")]
    Failed(String),
}

/// The screen. Every `show_*` replaces whatever was rendered before; media
/// outcomes come back asynchronously as `MediaEvent`s tagged with `token`.
pub trait VisualSurface: Send {
    fn show_image(&mut self, token: ShowToken, url: &str) -> Result<()>;
    fn show_video(&mut self, token: ShowToken, url: &str, muted: bool) -> Result<()>;
    /// Starts an embedded player muted with autoplay.
    fn show_youtube(&mut self, token: ShowToken, video_id: &str) -> Result<()>;
    fn show_web_page(&mut self, token: ShowToken, url: &str) -> Result<()>;
    /// Full-screen text panel used by clock, weather and qrcode items.
    fn show_panel(&mut self, token: ShowToken, text: &str) -> Result<()>;
    fn show_message(&mut self, text: &str) -> Result<()>;
    fn clear(&mut self) -> Result<()>;

    fn unmute_foreground(&mut self, volume: f64) -> Result<()>;
    fn foreground_muted(&mut self) -> Result<bool>;

    fn set_overlay(&mut self, slot: OverlaySlot, text: Option<&str>) -> Result<()>;
    fn set_audio_prompt(&mut self, visible: bool) -> Result<()>;
}

/// The single background-music channel.
pub trait AudioChannel: Send {
    fn load(&mut self, url: &str) -> Result<()>;
    fn attempt_play(&mut self) -> std::result::Result<Playing, PlayError>;
    fn pause(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn is_playing(&self) -> bool;
    fn set_volume(&mut self, volume: f64) -> Result<()>;
}
