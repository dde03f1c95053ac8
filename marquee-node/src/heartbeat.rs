use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::store::{DocumentStore, DEVICES};

pub struct HeartbeatManager {
    store: Arc<dyn DocumentStore>,
    device_id: String,
    period: Duration,
}

impl HeartbeatManager {
    pub fn new(store: Arc<dyn DocumentStore>, device_id: String, period: Duration) -> Self {
        Self {
            store,
            device_id,
            period,
        }
    }

    /// Beats immediately, then once per period until cancelled.
    pub async fn start(self, cancel: CancellationToken) {
        let mut tick = interval(self.period);
        let mut sys = System::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let heartbeat = collect_heartbeat_data(&mut sys);
                    if let Err(e) = self.store.update(DEVICES, &self.device_id, heartbeat).await {
                        tracing::warn!("Heartbeat for {} failed: {}", self.device_id, e);
                    }
                }
            }
        }
        tracing::debug!("Heartbeat stopped");
    }
}

fn collect_heartbeat_data(sys: &mut System) -> Value {
    sys.refresh_cpu();
    sys.refresh_memory();

    // Calculate average CPU usage across all cores
    let cpu_usage = if !sys.cpus().is_empty() {
        sys.cpus().iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / sys.cpus().len() as f32
    } else {
        0.0
    } as f64;

    let memory_usage = (sys.used_memory() as f64) / (1024.0 * 1024.0); // Convert to MB

    json!({
        "lastHeartbeat": Utc::now().to_rfc3339(),
        "cpuUsagePercent": cpu_usage,
        "memoryUsageMb": memory_usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_beats_immediately_and_stops_on_cancel() {
        let store = MemoryStore::new();
        store.put(DEVICES, "dev1", json!({"name": "Lobby"}));
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(
            Arc::new(store.clone()),
            "dev1".to_string(),
            Duration::from_secs(60),
        );
        let task = tokio::spawn(manager.start(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let doc = store.document(DEVICES, "dev1").unwrap();
        assert!(doc["lastHeartbeat"].is_string());
        assert_eq!(doc["name"], json!("Lobby"));

        cancel.cancel();
        task.await.unwrap();
    }
}
