use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::events::{PlayerEvent, TimerSlot};

/// One-shot timers keyed by slot. Arming a slot always cancels whatever was
/// armed there before, so a slot never has two live timers.
pub struct Timers {
    sender: UnboundedSender<PlayerEvent>,
    slots: HashMap<TimerSlot, (u64, JoinHandle<()>)>,
    seq: u64,
}

impl Timers {
    pub fn new(sender: UnboundedSender<PlayerEvent>) -> Self {
        Self {
            sender,
            slots: HashMap::new(),
            seq: 0,
        }
    }

    pub fn arm(&mut self, slot: TimerSlot, delay: Duration) -> u64 {
        self.cancel(slot);
        self.seq += 1;
        let seq = self.seq;
        let sender = self.sender.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(PlayerEvent::Timer { slot, seq });
        });

        self.slots.insert(slot, (seq, handle));
        seq
    }

    pub fn cancel(&mut self, slot: TimerSlot) {
        if let Some((_, handle)) = self.slots.remove(&slot) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.slots.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, slot: TimerSlot) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Claims a fired timer. Returns false for timers that were cancelled or
    /// re-armed after they were queued.
    pub fn fire(&mut self, slot: TimerSlot, seq: u64) -> bool {
        match self.slots.get(&slot) {
            Some((armed, _)) if *armed == seq => {
                self.slots.remove(&slot);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
