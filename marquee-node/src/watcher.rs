use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::events::{PlayerEvent, WatchTarget};
use crate::store::{DocumentStore, Subscription, SubscriptionHandle};

struct ActiveWatch {
    doc_id: String,
    generation: u64,
    forward: JoinHandle<()>,
    _handle: SubscriptionHandle,
}

/// At most one live subscription per target. Snapshots are forwarded into the
/// session inbox tagged with a generation so that anything queued by a
/// cancelled subscription can be told apart and dropped.
pub struct Watcher {
    target: WatchTarget,
    current: Option<ActiveWatch>,
    generation: u64,
}

impl Watcher {
    pub fn new(target: WatchTarget) -> Self {
        Self {
            target,
            current: None,
            generation: 0,
        }
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_ref().map(|active| active.doc_id.as_str())
    }

    /// Points the watcher at `id`. Returns false when it already watches that
    /// id. The previous subscription is released before the new one opens.
    pub fn watch(
        &mut self,
        store: &dyn DocumentStore,
        id: Option<&str>,
        events: &UnboundedSender<PlayerEvent>,
    ) -> bool {
        if self.current_id() == id {
            return false;
        }
        self.cancel();

        let Some(id) = id else {
            return true;
        };

        self.generation += 1;
        let generation = self.generation;
        let target = self.target;
        let Subscription {
            mut updates,
            handle,
        } = store.subscribe(target.collection(), id);

        let events = events.clone();
        let forward = tokio::spawn(async move {
            while let Some(document) = updates.recv().await {
                let snapshot = PlayerEvent::Snapshot {
                    target,
                    generation,
                    document,
                };
                if events.send(snapshot).is_err() {
                    break;
                }
            }
        });

        tracing::debug!("Watching {}/{} (generation {})", target.collection(), id, generation);
        self.current = Some(ActiveWatch {
            doc_id: id.to_string(),
            generation,
            forward,
            _handle: handle,
        });
        true
    }

    pub fn cancel(&mut self) {
        if let Some(active) = self.current.take() {
            active.forward.abort();
            tracing::debug!(
                "Released {}/{}",
                self.target.collection(),
                active.doc_id
            );
        }
    }

    /// Whether a snapshot tagged with `generation` belongs to the live
    /// subscription.
    pub fn accepts(&self, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
