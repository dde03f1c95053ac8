use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

pub const GESTURE_MESSAGE: &str = "marquee-gesture";

pub fn spawn_mpv(binary: &str, socket_path: &str, extra_args: &[String]) -> Result<Child> {
    if Path::new(socket_path).exists() {
        // Try to remove existing socket file
        let _ = std::fs::remove_file(socket_path);
    }

    let mut child = Command::new(binary)
        .arg("--idle")
        .arg("--no-terminal")
        .arg(format!("--input-ipc-server={}", socket_path))
        .args(extra_args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| anyhow!("Failed to start {} (is it installed?): {}", binary, e))?;

    // Wait for socket to be created
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(10) {
        if Path::new(socket_path).exists() {
            return Ok(child);
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(anyhow!("{} exited during startup: {}", binary, status));
        }
        thread::sleep(Duration::from_millis(100));
    }

    tracing::warn!("{} is slow to open {}", binary, socket_path);
    Ok(child)
}

/// Something mpv reported about a playlist entry.
#[derive(Debug, Clone, PartialEq)]
pub enum MpvEvent {
    Started(i64),
    Ended(i64),
    Failed(i64),
    Gesture,
}

/// Translates one line of mpv's event stream.
pub fn parse_event(line: &str, current_entry: &mut Option<i64>) -> Option<MpvEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    let entry = value["playlist_entry_id"].as_i64();

    match value["event"].as_str()? {
        "start-file" => {
            *current_entry = entry;
            None
        }
        "playback-restart" => current_entry.map(MpvEvent::Started),
        "end-file" => {
            let entry = entry.or(*current_entry)?;
            match value["reason"].as_str()? {
                "eof" => Some(MpvEvent::Ended(entry)),
                "error" => Some(MpvEvent::Failed(entry)),
                // "stop" is our own replace/stop, "quit" is shutdown.
                _ => None,
            }
        }
        "client-message" => {
            let args = value["args"].as_array()?;
            (args.first()?.as_str()? == GESTURE_MESSAGE).then_some(MpvEvent::Gesture)
        }
        _ => None,
    }
}

/// Follows mpv's event stream until cancelled or mpv goes away.
pub async fn listen_events(
    socket_path: String,
    sink: UnboundedSender<MpvEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let stream = tokio::net::UnixStream::connect(&socket_path).await?;
    // mpv drops clients whose write side closes, so the write half stays alive.
    let (read, _write) = stream.into_split();

    let mut lines = tokio::io::BufReader::new(read).lines();
    let mut current_entry = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Err(anyhow!("mpv closed {}", socket_path));
                };
                if let Some(event) = parse_event(&line, &mut current_entry) {
                    if sink.send(event).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

pub struct MpvClient {
    socket_path: String,
}

impl MpvClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    /// Replaces whatever is playing. Returns mpv's playlist entry id for the
    /// new file when mpv reports one.
    pub fn play(&self, url: &str, options: &[String]) -> Result<Option<i64>> {
        let mut args = vec![
            "loadfile".to_string(),
            url.to_string(),
            "replace".to_string(),
        ];

        // MPV 0.38+ requires an insertion index argument between mode and options.
        // Signature: loadfile url [mode [index [options]]]
        // We use "0" as the index (placeholder for 'replace' mode).
        if !options.is_empty() {
            args.push("0".to_string());
            args.push(options.join(","));
        }

        let response = self.send_command(json!({ "command": args }))?;
        Ok(response["data"]["playlist_entry_id"].as_i64())
    }

    pub fn set_property(&self, name: &str, value: Value) -> Result<()> {
        self.send_command(json!({
            "command": ["set_property", name, value]
        }))?;
        Ok(())
    }

    pub fn get_property(&self, name: &str) -> Result<Value> {
        let response = self.send_command(json!({
            "command": ["get_property", name]
        }))?;
        Ok(response["data"].clone())
    }

    pub fn stop(&self) -> Result<()> {
        self.send_command(json!({
            "command": ["stop"]
        }))?;
        Ok(())
    }

    /// Draws (or with `None`, removes) an ASS text layer above the video.
    pub fn osd_overlay(&self, id: i64, ass: Option<&str>) -> Result<()> {
        let command = match ass {
            Some(data) => json!({"name": "osd-overlay", "id": id, "format": "ass-events", "data": data}),
            None => json!({"name": "osd-overlay", "id": id, "format": "none", "data": ""}),
        };
        self.send_command(json!({ "command": command }))?;
        Ok(())
    }

    /// Routes a key or click on the mpv window back to us as a gesture.
    pub fn bind_gesture(&self, key: &str) -> Result<()> {
        self.send_command(json!({
            "command": ["keybind", key, format!("script-message {}", GESTURE_MESSAGE)]
        }))?;
        Ok(())
    }

    pub fn send_command(&self, cmd: Value) -> Result<Value> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_write_timeout(Some(Duration::from_secs(1)))?;
        stream.set_read_timeout(Some(Duration::from_secs(1)))?;

        let cmd_str = format!("{}\n", serde_json::to_string(&cmd)?);
        tracing::debug!(target: "marquee_node::mpv_client", "Sending command: {}", cmd_str.trim());
        stream.write_all(cmd_str.as_bytes())?;

        // Events can arrive on the same connection ahead of the reply.
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(anyhow!("mpv closed the connection"));
            }
            let response: Value = serde_json::from_str(&line)?;
            if response.get("event").is_some() {
                continue;
            }
            return match response["error"].as_str() {
                Some("success") | None => Ok(response),
                Some(error) => Err(anyhow!("mpv rejected {}: {}", cmd_str.trim(), error)),
            };
        }
    }
}
