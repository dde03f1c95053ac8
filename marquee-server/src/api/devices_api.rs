use crate::api::documents_api::status_for;
use crate::services::devices::{self, DeviceStatus};
use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
}

#[derive(Serialize)]
pub struct CreateDeviceResponse {
    pub id: String,
    pub pairing_code: String,
    pub device: Value,
}

pub async fn create_device(
    State(state): State<AppState>,
    Json(req): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<CreateDeviceResponse>), StatusCode> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (id, device) = devices::create_device(&state.documents, name).map_err(status_for)?;
    let pairing_code = device["pairingCode"].as_str().unwrap_or_default().to_string();

    Ok((
        StatusCode::CREATED,
        Json(CreateDeviceResponse {
            id,
            pairing_code,
            device,
        }),
    ))
}

pub async fn device_status(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeviceStatus>>, StatusCode> {
    let statuses = devices::device_statuses(
        &state.documents,
        state.config.devices.online_window_secs,
    )
    .map_err(status_for)?;
    Ok(Json(statuses))
}
