use tokio::sync::mpsc::UnboundedSender;

use crate::audio::{AudioGate, BlockedAction};
use crate::events::PlayerEvent;
use crate::surface::VisualSurface;
use crate::timers::Timers;

/// Output side shared by the playback engine, the music controller and the
/// widgets: the screen, the enable-audio gate and the timer slots.
pub struct Stage {
    pub surface: Box<dyn VisualSurface>,
    pub gate: AudioGate,
    pub timers: Timers,
    pub events: UnboundedSender<PlayerEvent>,
}

impl Stage {
    pub fn new(surface: Box<dyn VisualSurface>, events: UnboundedSender<PlayerEvent>) -> Self {
        Self {
            surface,
            gate: AudioGate::default(),
            timers: Timers::new(events.clone()),
            events,
        }
    }

    pub fn raise(&mut self, action: BlockedAction) {
        self.gate.raise(action, self.surface.as_mut());
    }

    pub fn withdraw(&mut self, action: BlockedAction) {
        self.gate.withdraw(action, self.surface.as_mut());
    }

    pub fn take_blocked(&mut self) -> Option<BlockedAction> {
        self.gate.take(self.surface.as_mut())
    }

    /// Releases everything the stage is holding: timers, the gate and
    /// whatever is on screen.
    pub fn reset(&mut self) {
        self.timers.cancel_all();
        self.take_blocked();
        if let Err(e) = self.surface.clear() {
            tracing::warn!("Failed to clear the screen: {}", e);
        }
    }
}
