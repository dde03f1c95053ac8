//! Screen and music channel backed by two `mpv --idle` processes, plus a
//! kiosk browser for web pages.

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Child;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::config::MpvConfig;
use crate::events::{MediaEvent, PlayerEvent, ShowToken};
use crate::kiosk::Kiosk;
use crate::mpv_client::{listen_events, spawn_mpv, MpvClient, MpvEvent};
use crate::surface::{AudioChannel, OverlaySlot, PlayError, Playing, VisualSurface};

const PANEL_LAYER: i64 = 1;
const PROMPT_LAYER: i64 = 20;
const GESTURE_KEYS: &[&str] = &["MBTN_LEFT", "SPACE", "ENTER", "KP_ENTER"];

fn overlay_layer(slot: OverlaySlot) -> (i64, &'static str) {
    match slot {
        OverlaySlot::Clock => (10, r"{\an9\fs36}"),
        OverlaySlot::Weather => (11, r"{\an7\fs28}"),
        OverlaySlot::News => (12, r"{\an1\fs24}"),
        OverlaySlot::Currency => (13, r"{\an3\fs24}"),
        OverlaySlot::Qr => (14, r"{\an3\fnmonospace\fs10}"),
    }
}

/// Makes arbitrary text safe to embed in an ASS event.
pub fn escape_ass(text: &str) -> String {
    text.replace('\\', "/")
        .replace('{', "(")
        .replace('}', ")")
        .replace('\n', r"\N")
}

/// Playlist entry ids of shown files, mapped back to the showing that
/// loaded them.
#[derive(Default)]
struct Entries {
    tokens: HashMap<i64, ShowToken>,
    latest: Option<ShowToken>,
}

impl Entries {
    fn register(&mut self, entry: Option<i64>, token: ShowToken) {
        self.tokens.clear();
        self.latest = Some(token);
        if let Some(entry) = entry {
            self.tokens.insert(entry, token);
        }
    }

    fn token(&self, entry: i64) -> Option<ShowToken> {
        if self.tokens.is_empty() {
            // Older mpv does not report entry ids for loadfile.
            return self.latest;
        }
        self.tokens.get(&entry).copied()
    }

    fn forget(&mut self) {
        self.tokens.clear();
        self.latest = None;
    }
}

fn start_listener(
    socket_path: String,
    cancel: CancellationToken,
    mut translate: impl FnMut(MpvEvent) -> Option<PlayerEvent> + Send + 'static,
    events: UnboundedSender<PlayerEvent>,
) {
    let (sink, mut incoming) = mpsc::unbounded_channel();
    let socket = socket_path.clone();
    tokio::spawn(async move {
        if let Err(e) = listen_events(socket, sink, cancel).await {
            tracing::error!("Lost mpv event stream on {}: {}", socket_path, e);
        }
    });
    tokio::spawn(async move {
        while let Some(event) = incoming.recv().await {
            if let Some(event) = translate(event) {
                if events.send(event).is_err() {
                    break;
                }
            }
        }
    });
}

pub struct MpvSurface {
    client: MpvClient,
    entries: Arc<Mutex<Entries>>,
    kiosk: Option<Kiosk>,
    browser_binary: Option<String>,
    process: Child,
}

impl MpvSurface {
    pub fn start(
        config: &MpvConfig,
        events: UnboundedSender<PlayerEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut args = vec![
            "--force-window=yes".to_string(),
            "--image-display-duration=inf".to_string(),
            "--keep-open=no".to_string(),
            "--osd-level=0".to_string(),
            "--cursor-autohide=always".to_string(),
            "--ytdl=yes".to_string(),
        ];
        if config.fullscreen {
            args.push("--fullscreen".to_string());
        }
        let process = spawn_mpv(&config.binary, &config.display_socket, &args)?;
        let client = MpvClient::new(config.display_socket.clone());
        for key in GESTURE_KEYS {
            if let Err(e) = client.bind_gesture(key) {
                tracing::warn!("Could not bind {} for audio unlock: {}", key, e);
            }
        }

        let entries = Arc::new(Mutex::new(Entries::default()));
        let lookup = Arc::clone(&entries);
        start_listener(
            config.display_socket.clone(),
            cancel,
            move |event| {
                let token_for = |entry| lookup.lock().ok().and_then(|e| e.token(entry));
                match event {
                    MpvEvent::Gesture => Some(PlayerEvent::UserGesture),
                    MpvEvent::Started(entry) => token_for(entry).map(|t| PlayerEvent::Media(MediaEvent::Started(t))),
                    MpvEvent::Ended(entry) => token_for(entry).map(|t| PlayerEvent::Media(MediaEvent::Ended(t))),
                    MpvEvent::Failed(entry) => token_for(entry).map(|t| PlayerEvent::Media(MediaEvent::Failed(t))),
                }
            },
            events,
        );

        Ok(Self {
            client,
            entries,
            kiosk: None,
            browser_binary: config.browser_binary.clone(),
            process,
        })
    }

    fn load(&mut self, token: ShowToken, url: &str, options: &[String]) -> Result<()> {
        self.kiosk = None;
        self.client.osd_overlay(PANEL_LAYER, None)?;
        let entry = self.client.play(url, options)?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.register(entry, token);
        }
        Ok(())
    }

    fn blank(&mut self) -> Result<()> {
        self.kiosk = None;
        if let Ok(mut entries) = self.entries.lock() {
            entries.forget();
        }
        self.client.stop()
    }

    fn panel(&mut self, text: &str) -> Result<()> {
        self.blank()?;
        let ass = format!(r"{{\an5\fnmonospace\fs40}}{}", escape_ass(text));
        self.client.osd_overlay(PANEL_LAYER, Some(&ass))
    }
}

impl Drop for MpvSurface {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

impl VisualSurface for MpvSurface {
    fn show_image(&mut self, token: ShowToken, url: &str) -> Result<()> {
        self.load(token, url, &[])
    }

    fn show_video(&mut self, token: ShowToken, url: &str, muted: bool) -> Result<()> {
        let mute = if muted { "mute=yes" } else { "mute=no" };
        self.load(token, url, &[mute.to_string()])
    }

    fn show_youtube(&mut self, token: ShowToken, video_id: &str) -> Result<()> {
        let url = format!("https://www.youtube.com/watch?v={}", video_id);
        self.load(token, &url, &["mute=yes".to_string()])
    }

    fn show_web_page(&mut self, _token: ShowToken, url: &str) -> Result<()> {
        self.blank()?;
        self.client.osd_overlay(PANEL_LAYER, None)?;
        self.kiosk = Some(Kiosk::open(self.browser_binary.as_deref(), url)?);
        Ok(())
    }

    fn show_panel(&mut self, _token: ShowToken, text: &str) -> Result<()> {
        self.panel(text)
    }

    fn show_message(&mut self, text: &str) -> Result<()> {
        self.panel(text)
    }

    fn clear(&mut self) -> Result<()> {
        self.blank()?;
        self.client.osd_overlay(PANEL_LAYER, None)
    }

    fn unmute_foreground(&mut self, volume: f64) -> Result<()> {
        self.client.set_property("mute", json!(false))?;
        self.client.set_property("volume", json!(volume))
    }

    fn foreground_muted(&mut self) -> Result<bool> {
        Ok(self.client.get_property("mute")?.as_bool().unwrap_or(false))
    }

    fn set_overlay(&mut self, slot: OverlaySlot, text: Option<&str>) -> Result<()> {
        let (layer, style) = overlay_layer(slot);
        match text {
            Some(text) => {
                let ass = format!("{}{}", style, escape_ass(text));
                self.client.osd_overlay(layer, Some(&ass))
            }
            None => self.client.osd_overlay(layer, None),
        }
    }

    fn set_audio_prompt(&mut self, visible: bool) -> Result<()> {
        if visible {
            self.client
                .osd_overlay(PROMPT_LAYER, Some(r"{\an2\fs32}Tap to enable audio"))
        } else {
            self.client.osd_overlay(PROMPT_LAYER, None)
        }
    }
}

pub struct MpvAudio {
    client: MpvClient,
    process: Child,
}

impl MpvAudio {
    pub fn start(
        config: &MpvConfig,
        events: UnboundedSender<PlayerEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let args = vec!["--no-video".to_string(), "--audio-display=no".to_string()];
        let process = spawn_mpv(&config.binary, &config.audio_socket, &args)?;

        start_listener(
            config.audio_socket.clone(),
            cancel,
            |event| match event {
                MpvEvent::Ended(_) => Some(PlayerEvent::Media(MediaEvent::MusicEnded)),
                MpvEvent::Failed(_) => Some(PlayerEvent::Media(MediaEvent::MusicFailed)),
                MpvEvent::Started(_) | MpvEvent::Gesture => None,
            },
            events,
        );

        Ok(Self {
            client: MpvClient::new(config.audio_socket.clone()),
            process,
        })
    }
}

impl Drop for MpvAudio {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

impl AudioChannel for MpvAudio {
    fn load(&mut self, url: &str) -> Result<()> {
        self.client.set_property("pause", json!(true))?;
        self.client.play(url, &[])?;
        Ok(())
    }

    fn attempt_play(&mut self) -> std::result::Result<Playing, PlayError> {
        self.client
            .set_property("pause", json!(false))
            .map(|_| Playing)
            .map_err(|e| PlayError::Failed(e.to_string()))
    }

    fn pause(&mut self) -> Result<()> {
        self.client.set_property("pause", json!(true))
    }

    fn stop(&mut self) -> Result<()> {
        self.client.stop()
    }

    fn is_playing(&self) -> bool {
        let flag = |name: &str| self.client.get_property(name).ok().and_then(|v: Value| v.as_bool());
        flag("pause") == Some(false) && flag("idle-active") == Some(false)
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.client.set_property("volume", json!(volume))
    }
}
