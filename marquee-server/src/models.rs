use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde_json::Value;

// Document models
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::documents)]
pub struct DocumentRow {
    pub collection: String,
    pub doc_id: String,
    pub body: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl DocumentRow {
    /// The stored JSON body. Rows that no longer parse read as absent.
    pub fn document(&self) -> Option<Value> {
        match serde_json::from_str(&self.body) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(
                    "Stored document {}/{} is not valid JSON: {}",
                    self.collection,
                    self.doc_id,
                    e
                );
                None
            }
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::documents)]
pub struct NewDocument<'a> {
    pub collection: &'a str,
    pub doc_id: &'a str,
    pub body: String,
    pub updated_at: NaiveDateTime,
}
