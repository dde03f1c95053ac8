//! Client side of the push-capable document store.
//!
//! Every record the player consumes (device, group, playlists, media) is a
//! JSON document addressed by collection and id. Subscriptions deliver the
//! current snapshot first and then every later change, with `None` standing
//! for "the record does not exist".

#[cfg(test)]
pub mod memory;
pub mod remote;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

pub use remote::RemoteStore;

pub const DEVICES: &str = "devices";
pub const GROUPS: &str = "groups";
pub const PLAYLISTS: &str = "playlists";
pub const MUSIC_PLAYLISTS: &str = "musicPlaylists";
pub const MEDIA: &str = "media";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not connected to the document store")]
    Disconnected,
    #[error("document store did not answer in time")]
    Timeout,
    #[error("document store rejected the request: {0}")]
    Rejected(String),
}

/// Releases the server-side listener when dropped.
pub struct SubscriptionHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

pub struct Subscription {
    pub updates: UnboundedReceiver<Option<Value>>,
    pub handle: SubscriptionHandle,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Starts listening. Never blocks: the first snapshot arrives on
    /// `updates` like any other.
    fn subscribe(&self, collection: &str, id: &str) -> Subscription;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Shallow merge of `fields` into an existing document. Fails with
    /// `Rejected` when the document does not exist.
    async fn update(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError>;

    /// Id of the unpaired device carrying `code`, if any.
    async fn find_unpaired_by_code(&self, code: &str) -> Result<Option<String>, StoreError>;
}
