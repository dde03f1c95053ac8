mod audio;
mod config;
mod events;
mod heartbeat;
mod kiosk;
mod model;
mod mpv_client;
mod mpv_surface;
mod pairing;
mod playback;
mod schedule;
mod session;
mod stage;
mod store;
mod surface;
mod timers;
mod watcher;
mod widget_sources;
mod widgets;
mod youtube;

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::events::PlayerEvent;
use crate::mpv_surface::{MpvAudio, MpvSurface};
use crate::pairing::{DeviceIdentity, PairingClient, PairingError};
use crate::session::{Outputs, Session, SessionEnd};
use crate::store::{DocumentStore, RemoteStore};
use crate::widget_sources::HttpWidgetSources;

#[derive(Parser)]
#[command(version, author = "MARQUEE AUTHORS", about = "Marquee Node\nLicensed under AGPLv3\nCreated by MARQUEE AUTHORS", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "node-config.toml")]
    config: String,

    /// Generate a default configuration template to stdout
    #[arg(long)]
    generate_config: bool,

    /// Pair with this code instead of prompting for one
    #[arg(long)]
    pairing_code: Option<String>,
}

fn prompt_for_code() -> Result<String> {
    use dialoguer::{theme::ColorfulTheme, Input};

    let code: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Pairing code shown in the dashboard")
        .interact_text()?;
    Ok(code)
}

/// Pairs until it works. Without a terminal the code has to come from the
/// command line.
async fn pair(
    store: &dyn DocumentStore,
    mut code: Option<String>,
    identity_path: &Path,
) -> Result<DeviceIdentity> {
    let client = PairingClient::new(store);
    loop {
        let raw = match code.take() {
            Some(code) => code,
            None if console::user_attended() => prompt_for_code()?,
            None => return Err(anyhow!("Device is not paired; pass --pairing-code")),
        };

        match client.pair(&raw).await {
            Ok(identity) => {
                identity.save(identity_path)?;
                tracing::info!("Paired as device {}", identity.device_id);
                return Ok(identity);
            }
            Err(PairingError::Store(e)) => {
                tracing::warn!("Pairing request failed: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                code = Some(raw);
            }
            Err(e) => eprintln!("{}", e),
        }
    }
}

fn start_outputs(
    config: &Config,
    events: UnboundedSender<PlayerEvent>,
    cancel: &CancellationToken,
) -> Result<Outputs> {
    Ok(Outputs {
        surface: Box::new(MpvSurface::start(&config.mpv, events.clone(), cancel.clone())?),
        audio: Box::new(MpvAudio::start(&config.mpv, events, cancel.clone())?),
        sources: Arc::new(HttpWidgetSources::new(&config.widgets)?),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.generate_config {
        println!("{}", Config::default_template());
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marquee_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::fs::metadata(&cli.config).is_err() {
        eprintln!("Error: Configuration file '{}' not found.", cli.config);
        eprintln!("Run with --generate-config to see a template.");
        std::process::exit(1);
    }
    let config = Config::load(&cli.config)?;
    tracing::info!("Loaded configuration for node: {}", config.node_name);

    let store: Arc<dyn DocumentStore> =
        Arc::new(RemoteStore::connect(&config.server_url, config.request_timeout()));
    let identity_path = Path::new(&config.identity_path);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            ctrl_c.cancel();
        }
    });

    let mut pairing_code = cli.pairing_code;
    loop {
        let identity = match DeviceIdentity::load(identity_path)? {
            Some(identity) => identity,
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    identity = pair(store.as_ref(), pairing_code.take(), identity_path) => identity?,
                }
            }
        };

        let (events, inbox) = unbounded_channel();
        let media_cancel = shutdown.child_token();
        let outputs = start_outputs(&config, events.clone(), &media_cancel)?;
        let session = Session::new(
            &config,
            identity.device_id,
            Arc::clone(&store),
            outputs,
            events,
            inbox,
        );

        let end = session.run(shutdown.clone()).await;
        media_cancel.cancel();
        match end {
            SessionEnd::Shutdown => return Ok(()),
            SessionEnd::Unpaired => {
                tracing::warn!("Device was unpaired from the dashboard; pairing again");
                DeviceIdentity::clear(identity_path)?;
            }
        }
    }
}
