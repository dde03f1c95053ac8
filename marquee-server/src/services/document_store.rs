//! JSON documents addressed by (collection, id), with a change feed.
//!
//! Every write bumps a store-wide revision and is published on a broadcast
//! channel while the write lock is still held, so subscribers observe
//! changes in commit order and can discard anything older than a snapshot
//! they already sent.

use chrono::Utc;
use diesel::prelude::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::db::{DbConnection, DbPool};
use crate::models::{DocumentRow, NewDocument};

pub const DEVICES: &str = "devices";
pub const MEDIA: &str = "media";
pub const MENUS: &str = "menus";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("database error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("{0}/{1} not found")]
    NotFound(String, String),
    #[error("documents must be JSON objects")]
    NotAnObject,
}

/// One committed write. `document` is `None` for a deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub revision: u64,
    pub collection: String,
    pub doc_id: String,
    pub document: Option<Value>,
}

/// A document together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub revision: u64,
    pub document: Option<Value>,
}

#[derive(Clone)]
pub struct DocumentService {
    db: DbPool,
    changes: broadcast::Sender<Change>,
    revision: Arc<Mutex<u64>>,
}

fn load(
    conn: &mut DbConnection,
    wanted_collection: &str,
    wanted_id: &str,
) -> Result<Option<Value>, StoreError> {
    use crate::schema::documents::dsl::*;

    let row = documents
        .filter(collection.eq(wanted_collection))
        .filter(doc_id.eq(wanted_id))
        .select(DocumentRow::as_select())
        .first(conn)
        .optional()?;
    Ok(row.and_then(|row| row.document()))
}

fn require_object(document: &Value) -> Result<(), StoreError> {
    if document.is_object() {
        Ok(())
    } else {
        Err(StoreError::NotAnObject)
    }
}

impl DocumentService {
    pub fn new(db: DbPool, feed_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(feed_capacity);
        Self {
            db,
            changes,
            revision: Arc::new(Mutex::new(0)),
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.revision
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads a document and the revision it reflects. Any change with a
    /// higher revision happened after this read.
    pub fn snapshot(&self, collection: &str, doc_id: &str) -> Result<Snapshot, StoreError> {
        let mut conn = self.db.get()?;
        let revision = self.lock();
        let document = load(&mut conn, collection, doc_id)?;
        Ok(Snapshot {
            revision: *revision,
            document,
        })
    }

    pub fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.db.get()?;
        load(&mut conn, collection, doc_id)
    }

    /// Every document of a collection, ordered by id.
    pub fn list(&self, wanted_collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        use crate::schema::documents::dsl::*;

        let mut conn = self.db.get()?;
        let rows = documents
            .filter(collection.eq(wanted_collection))
            .order(doc_id.asc())
            .select(DocumentRow::as_select())
            .load(&mut conn)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let document = row.document()?;
                Some((row.doc_id, document))
            })
            .collect())
    }

    fn commit(
        &self,
        conn: &mut DbConnection,
        revision: &mut MutexGuard<'_, u64>,
        wanted_collection: &str,
        wanted_id: &str,
        document: Option<Value>,
    ) -> Result<(), StoreError> {
        use crate::schema::documents::dsl::*;

        match &document {
            Some(value) => {
                let now = Utc::now().naive_utc();
                let row = NewDocument {
                    collection: wanted_collection,
                    doc_id: wanted_id,
                    body: value.to_string(),
                    updated_at: now,
                };
                diesel::insert_into(documents)
                    .values(&row)
                    .on_conflict((collection, doc_id))
                    .do_update()
                    .set((body.eq(value.to_string()), updated_at.eq(now)))
                    .execute(conn)?;
            }
            None => {
                diesel::delete(
                    documents
                        .filter(collection.eq(wanted_collection))
                        .filter(doc_id.eq(wanted_id)),
                )
                .execute(conn)?;
            }
        }

        **revision += 1;
        let change = Change {
            revision: **revision,
            collection: wanted_collection.to_string(),
            doc_id: wanted_id.to_string(),
            document,
        };
        tracing::debug!(
            "Committed {}/{} at revision {}",
            change.collection,
            change.doc_id,
            change.revision
        );
        // No receivers simply means nobody is connected.
        let _ = self.changes.send(change);
        Ok(())
    }

    /// Replaces (or creates) a document.
    pub fn put(&self, collection: &str, doc_id: &str, document: Value) -> Result<Value, StoreError> {
        require_object(&document)?;
        let mut conn = self.db.get()?;
        let mut revision = self.lock();
        self.commit(&mut conn, &mut revision, collection, doc_id, Some(document.clone()))?;
        Ok(document)
    }

    /// Creates a document under a fresh id.
    pub fn create(&self, collection: &str, document: Value) -> Result<(String, Value), StoreError> {
        let doc_id = uuid::Uuid::new_v4().to_string();
        let document = self.put(collection, &doc_id, document)?;
        Ok((doc_id, document))
    }

    /// Shallow merge: top-level fields of `fields` overwrite the stored ones.
    /// Missing documents are not created.
    pub fn merge(&self, collection: &str, doc_id: &str, fields: Value) -> Result<Value, StoreError> {
        let Value::Object(fields) = fields else {
            return Err(StoreError::NotAnObject);
        };
        let mut conn = self.db.get()?;
        let mut revision = self.lock();

        let Some(Value::Object(mut document)) = load(&mut conn, collection, doc_id)? else {
            return Err(StoreError::NotFound(collection.to_string(), doc_id.to_string()));
        };
        document.extend(fields);
        let document = Value::Object(document);

        self.commit(&mut conn, &mut revision, collection, doc_id, Some(document.clone()))?;
        Ok(document)
    }

    /// Returns whether there was anything to delete.
    pub fn delete(&self, collection: &str, doc_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.db.get()?;
        let mut revision = self.lock();
        if load(&mut conn, collection, doc_id)?.is_none() {
            return Ok(false);
        }
        self.commit(&mut conn, &mut revision, collection, doc_id, None)?;
        Ok(true)
    }

    /// Id of the unpaired device currently showing `code`.
    pub fn find_unpaired(&self, code: &str) -> Result<Option<String>, StoreError> {
        let devices = self.list(DEVICES)?;
        Ok(devices
            .into_iter()
            .find(|(_, device)| {
                device["pairingCode"].as_str() == Some(code)
                    && device["isPaired"] != json!(true)
            })
            .map(|(id, _)| id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn test_put_get_and_delete() {
        let (pool, _dir) = test_pool();
        let store = DocumentService::new(pool, 16);

        assert_eq!(store.get("playlists", "p1").unwrap(), None);
        store.put("playlists", "p1", json!({"name": "Lobby"})).unwrap();
        store.put("playlists", "p1", json!({"name": "Lobby loop"})).unwrap();
        assert_eq!(
            store.get("playlists", "p1").unwrap(),
            Some(json!({"name": "Lobby loop"}))
        );

        assert!(store.delete("playlists", "p1").unwrap());
        assert!(!store.delete("playlists", "p1").unwrap());
        assert_eq!(store.get("playlists", "p1").unwrap(), None);
    }

    #[test]
    fn test_merge_is_shallow_and_requires_existing_document() {
        let (pool, _dir) = test_pool();
        let store = DocumentService::new(pool, 16);

        let err = store.merge(DEVICES, "d1", json!({"isPaired": true})).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(..)));

        store
            .put(DEVICES, "d1", json!({"name": "Bar", "clockWidget": {"enabled": true, "timezone": "UTC"}}))
            .unwrap();
        let merged = store
            .merge(DEVICES, "d1", json!({"clockWidget": {"enabled": false}}))
            .unwrap();
        assert_eq!(merged["name"], json!("Bar"));
        assert_eq!(merged["clockWidget"], json!({"enabled": false}));
    }

    #[test]
    fn test_non_objects_are_rejected() {
        let (pool, _dir) = test_pool();
        let store = DocumentService::new(pool, 16);
        assert!(matches!(
            store.put("media", "m1", json!([1, 2])),
            Err(StoreError::NotAnObject)
        ));
    }

    #[test]
    fn test_changes_carry_increasing_revisions() {
        let (pool, _dir) = test_pool();
        let store = DocumentService::new(pool, 16);
        let mut changes = store.subscribe_changes();

        store.put("media", "m1", json!({"url": "a.mp3"})).unwrap();
        let snapshot = store.snapshot("media", "m1").unwrap();
        store.delete("media", "m1").unwrap();

        let first = changes.try_recv().unwrap();
        let second = changes.try_recv().unwrap();
        assert_eq!(first.document, Some(json!({"url": "a.mp3"})));
        assert_eq!(snapshot.revision, first.revision);
        assert_eq!(second.document, None);
        assert!(second.revision > snapshot.revision);
    }

    #[test]
    fn test_find_unpaired_skips_paired_devices() {
        let (pool, _dir) = test_pool();
        let store = DocumentService::new(pool, 16);
        store
            .put(DEVICES, "old", json!({"pairingCode": "ABC123", "isPaired": true}))
            .unwrap();
        assert_eq!(store.find_unpaired("ABC123").unwrap(), None);

        store
            .put(DEVICES, "new", json!({"pairingCode": "ABC123", "isPaired": false}))
            .unwrap();
        assert_eq!(store.find_unpaired("ABC123").unwrap(), Some("new".to_string()));
        assert_eq!(store.find_unpaired("ZZZ999").unwrap(), None);
    }
}
