//! Read-only pages a phone reaches by scanning a screen's QR code.

use crate::api::documents_api::status_for;
use crate::services::devices::companion_digest;
use crate::services::document_store::{DEVICES, MEDIA, MENUS};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct CompanionSettings {
    name: String,
    qr_enabled: bool,
    qr_code_items: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CompanionItem {
    pub id: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct CompanionPage {
    pub device: String,
    pub items: Vec<CompanionItem>,
}

/// The media a screen currently offers to phones. Links stop working as
/// soon as the selection changes or the QR overlay is switched off.
pub async fn companion(
    State(state): State<AppState>,
    Path((device_id, digest)): Path<(String, String)>,
) -> Result<Json<CompanionPage>, StatusCode> {
    let device = state
        .documents
        .get(DEVICES, &device_id)
        .map_err(status_for)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let settings: CompanionSettings =
        serde_json::from_value(device).map_err(|_| StatusCode::NOT_FOUND)?;

    if !settings.qr_enabled || companion_digest(&settings.qr_code_items) != digest {
        return Err(StatusCode::NOT_FOUND);
    }

    let mut items = Vec::new();
    for id in settings.qr_code_items {
        let Some(media) = state.documents.get(MEDIA, &id).map_err(status_for)? else {
            continue;
        };
        items.push(CompanionItem {
            name: media["name"].as_str().unwrap_or_default().to_string(),
            url: media["url"].as_str().unwrap_or_default().to_string(),
            id,
        });
    }

    Ok(Json(CompanionPage {
        device: settings.name,
        items,
    }))
}

pub async fn menu(
    State(state): State<AppState>,
    Path(menu_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .documents
        .get(MENUS, &menu_id)
        .map_err(status_for)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
