//! In-process document store for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedSender};

use super::{DocumentStore, StoreError, Subscription, SubscriptionHandle, DEVICES};

type Key = (String, String);

#[derive(Default)]
struct Inner {
    documents: HashMap<Key, Value>,
    listeners: HashMap<Key, Vec<(u64, UnboundedSender<Option<Value>>)>>,
    next_listener: u64,
    gets: usize,
    failing_gets: usize,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn key(collection: &str, id: &str) -> Key {
    (collection.to_string(), id.to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the document and notifies listeners.
    pub fn put(&self, collection: &str, id: &str, document: Value) {
        let mut inner = self.inner.lock().unwrap();
        let key = key(collection, id);
        inner.documents.insert(key.clone(), document.clone());
        notify(&mut inner, &key, Some(document));
    }

    pub fn delete(&self, collection: &str, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let key = key(collection, id);
        inner.documents.remove(&key);
        notify(&mut inner, &key, None);
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .unwrap()
            .documents
            .get(&key(collection, id))
            .cloned()
    }

    pub fn subscriber_count(&self, collection: &str, id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .get(&key(collection, id))
            .map_or(0, Vec::len)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn get_count(&self) -> usize {
        self.inner.lock().unwrap().gets
    }

    /// The next `count` reads fail as if the connection had dropped.
    pub fn fail_next_gets(&self, count: usize) {
        self.inner.lock().unwrap().failing_gets = count;
    }
}

fn notify(inner: &mut Inner, key: &Key, document: Option<Value>) {
    if let Some(listeners) = inner.listeners.get_mut(key) {
        listeners.retain(|(_, sink)| sink.send(document.clone()).is_ok());
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn subscribe(&self, collection: &str, id: &str) -> Subscription {
        let (sink, updates) = mpsc::unbounded_channel();
        let key = key(collection, id);

        let listener_id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_listener += 1;
            let listener_id = inner.next_listener;
            let _ = sink.send(inner.documents.get(&key).cloned());
            inner
                .listeners
                .entry(key.clone())
                .or_default()
                .push((listener_id, sink));
            listener_id
        };

        let inner = Arc::clone(&self.inner);
        Subscription {
            updates,
            handle: SubscriptionHandle::new(move || {
                if let Ok(mut inner) = inner.lock() {
                    if let Some(listeners) = inner.listeners.get_mut(&key) {
                        listeners.retain(|(id, _)| *id != listener_id);
                        if listeners.is_empty() {
                            inner.listeners.remove(&key);
                        }
                    }
                }
            }),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.gets += 1;
        if inner.failing_gets > 0 {
            inner.failing_gets -= 1;
            return Err(StoreError::Disconnected);
        }
        Ok(inner.documents.get(&key(collection, id)).cloned())
    }

    async fn update(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = key(collection, id);
        let Some(Value::Object(document)) = inner.documents.get_mut(&key) else {
            return Err(StoreError::Rejected(format!("{}/{} does not exist", collection, id)));
        };
        if let Value::Object(fields) = fields {
            for (name, value) in fields {
                document.insert(name, value);
            }
        }
        let merged = Value::Object(document.clone());
        notify(&mut inner, &key, Some(merged));
        Ok(())
    }

    async fn find_unpaired_by_code(&self, code: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<&String> = inner
            .documents
            .iter()
            .filter(|((collection, _), doc)| {
                collection == DEVICES
                    && doc.get("pairingCode").and_then(Value::as_str) == Some(code)
                    && !doc.get("isPaired").and_then(Value::as_bool).unwrap_or(false)
            })
            .map(|((_, id), _)| id)
            .collect();
        matches.sort();
        Ok(matches.first().map(|id| id.to_string()))
    }
}
