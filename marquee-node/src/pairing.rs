use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::Path;

use crate::store::{DocumentStore, StoreError, DEVICES};

pub const CODE_LENGTH: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("pairing codes are {CODE_LENGTH} letters or digits")]
    Malformed,
    #[error("no unpaired device uses that code")]
    InvalidCode,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Upper-cases the code and strips the separators people type.
pub fn normalize_code(raw: &str) -> Result<String, PairingError> {
    let code: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if code.len() != CODE_LENGTH || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(PairingError::Malformed);
    }
    Ok(code)
}

/// The locally persisted result of pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub paired_at: DateTime<Utc>,
}

impl DeviceIdentity {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable identity file {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn clear(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct PairingClient<'a> {
    store: &'a dyn DocumentStore,
}

impl<'a> PairingClient<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self { store }
    }

    /// Claims the unpaired device carrying `raw_code`. Nothing changes on
    /// failure, so the caller can simply ask again.
    pub async fn pair(&self, raw_code: &str) -> Result<DeviceIdentity, PairingError> {
        let code = normalize_code(raw_code)?;
        let device_id = self
            .store
            .find_unpaired_by_code(&code)
            .await?
            .ok_or(PairingError::InvalidCode)?;

        self.store
            .update(
                DEVICES,
                &device_id,
                json!({"isPaired": true, "pairingCode": null}),
            )
            .await?;

        tracing::info!("Paired as device {}", device_id);
        Ok(DeviceIdentity {
            device_id,
            paired_at: Utc::now(),
        })
    }
}
