use crate::services::devices::{device_statuses, DeviceStatus};
use crate::AppState;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::interval;

pub async fn run(state: AppState) {
    let period = Duration::from_secs(state.config.devices.monitor_interval_secs.max(1));
    let mut tick = interval(period);
    let mut last_seen = HashMap::new();

    loop {
        tick.tick().await;

        let window = state.config.devices.online_window_secs;
        match device_statuses(&state.documents, window) {
            Ok(statuses) => {
                for status in transitions(&mut last_seen, &statuses) {
                    if status.online {
                        tracing::info!("Device {} ({}) is online", status.id, status.name);
                    } else {
                        tracing::warn!("Device {} ({}) went offline", status.id, status.name);
                    }
                }
            }
            Err(e) => tracing::error!("Heartbeat monitor error: {}", e),
        }
    }
}

/// Paired devices whose online state differs from the previous pass.
/// Devices seen for the first time only count when they are online.
fn transitions<'a>(
    last_seen: &mut HashMap<String, bool>,
    statuses: &'a [DeviceStatus],
) -> Vec<&'a DeviceStatus> {
    let changed = statuses
        .iter()
        .filter(|status| status.is_paired)
        .filter(|status| last_seen.get(&status.id).copied().unwrap_or(false) != status.online)
        .collect();

    last_seen.clear();
    last_seen.extend(
        statuses
            .iter()
            .map(|status| (status.id.clone(), status.online)),
    );
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, online: bool) -> DeviceStatus {
        DeviceStatus {
            id: id.to_string(),
            name: id.to_string(),
            is_paired: true,
            online,
            last_heartbeat: None,
        }
    }

    #[test]
    fn test_reports_only_crossings() {
        let mut last_seen = HashMap::new();

        let first = [status("a", true), status("b", false)];
        let changed: Vec<_> = transitions(&mut last_seen, &first).iter().map(|s| s.id.clone()).collect();
        assert_eq!(changed, vec!["a"]);

        assert!(transitions(&mut last_seen, &first).is_empty());

        let second = [status("a", false), status("b", false)];
        let changed: Vec<_> = transitions(&mut last_seen, &second).iter().map(|s| s.id.clone()).collect();
        assert_eq!(changed, vec!["a"]);
    }
}
