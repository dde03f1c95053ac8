use crate::services::document_store::StoreError;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
pub struct DocumentEntry {
    pub id: String,
    pub document: Value,
}

pub fn status_for(e: StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(..) => StatusCode::NOT_FOUND,
        StoreError::NotAnObject => StatusCode::UNPROCESSABLE_ENTITY,
        e => {
            tracing::error!("Document store error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn check_collection(collection: &str) -> Result<(), StatusCode> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StatusCode::BAD_REQUEST)
    }
}

pub async fn list_documents(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<DocumentEntry>>, StatusCode> {
    check_collection(&collection)?;
    let entries = state
        .documents
        .list(&collection)
        .map_err(status_for)?
        .into_iter()
        .map(|(id, document)| DocumentEntry { id, document })
        .collect();
    Ok(Json(entries))
}

pub async fn create_document(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(document): Json<Value>,
) -> Result<(StatusCode, Json<DocumentEntry>), StatusCode> {
    check_collection(&collection)?;
    let (id, document) = state
        .documents
        .create(&collection, document)
        .map_err(status_for)?;
    Ok((StatusCode::CREATED, Json(DocumentEntry { id, document })))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    check_collection(&collection)?;
    state
        .documents
        .get(&collection, &id)
        .map_err(status_for)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn put_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(document): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    check_collection(&collection)?;
    let document = state
        .documents
        .put(&collection, &id, document)
        .map_err(status_for)?;
    Ok(Json(document))
}

pub async fn patch_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(fields): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    check_collection(&collection)?;
    let document = state
        .documents
        .merge(&collection, &id, fields)
        .map_err(status_for)?;
    Ok(Json(document))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, StatusCode> {
    check_collection(&collection)?;
    if state
        .documents
        .delete(&collection, &id)
        .map_err(status_for)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
