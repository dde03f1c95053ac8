use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::services::document_store::{DocumentService, StoreError, DEVICES};

pub const PAIRING_CODE_LENGTH: usize = 6;
// No 0/O or 1/I, people copy these codes off a screen.
const PAIRING_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LENGTH)
        .map(|_| PAIRING_ALPHABET[rng.gen_range(0..PAIRING_ALPHABET.len())] as char)
        .collect()
}

/// Registers an unpaired device under a code no other unpaired device is
/// showing.
pub fn create_device(store: &DocumentService, name: &str) -> Result<(String, Value), StoreError> {
    let mut code = generate_pairing_code();
    while store.find_unpaired(&code)?.is_some() {
        code = generate_pairing_code();
    }

    let device = json!({
        "name": name,
        "pairingCode": code,
        "isPaired": false,
        "managedByGroup": false,
        "createdAt": Utc::now().to_rfc3339(),
    });
    let (id, device) = store.create(DEVICES, device)?;
    tracing::info!("Created device {} ({}) with pairing code {}", id, name, code);
    Ok((id, device))
}

/// First 16 hex characters of SHA-256 over the selected media ids joined by
/// newlines. Changes whenever the selection does.
pub fn companion_digest(media_ids: &[String]) -> String {
    let digest = Sha256::digest(media_ids.join("\n").as_bytes());
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    pub is_paired: bool,
    pub online: bool,
    pub last_heartbeat: Option<String>,
}

pub fn device_status(id: &str, device: &Value, now: DateTime<Utc>, window_secs: i64) -> DeviceStatus {
    let last_heartbeat = device["lastHeartbeat"].as_str().map(str::to_string);
    let online = last_heartbeat
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .is_some_and(|at| now.signed_duration_since(at).num_seconds() <= window_secs);

    DeviceStatus {
        id: id.to_string(),
        name: device["name"].as_str().unwrap_or_default().to_string(),
        is_paired: device["isPaired"].as_bool().unwrap_or(false),
        online,
        last_heartbeat,
    }
}

pub fn device_statuses(store: &DocumentService, window_secs: i64) -> Result<Vec<DeviceStatus>, StoreError> {
    let now = Utc::now();
    Ok(store
        .list(DEVICES)?
        .iter()
        .map(|(id, device)| device_status(id, device, now, window_secs))
        .collect())
}
