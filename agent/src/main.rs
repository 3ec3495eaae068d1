//! syncam agent – keeps a rolling buffer and answers capture broadcasts.
//!
//! This binary:
//! 1. Reads configuration from `syncam.conf`
//! 2. Finds the coordinator (config, then mDNS, then localhost)
//! 3. Connects the realtime channel and reconnects on loss
//! 4. Runs the rolling buffer once the session has started
//! 5. Reads conductor commands from stdin

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use syncam_agent::agent::{AgentSettings, DeviceAgent};
use syncam_agent::buffer::{RollingBuffer, Timing};
use syncam_agent::source::FfmpegSource;
use syncam_agent::upload::HttpUploader;
use syncam_agent::{client, console};
use syncam_common::config::{self, Config};
use syncam_common::discovery::{self, ServiceRole};

const FALLBACK_COORDINATOR: &str = "ws://localhost:8090/ws";

/// How long to browse mDNS for a coordinator.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config =
        config::load_or_default(&PathBuf::from(&config_path)).context("Config load failed")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        signal.cancel();
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── coordinator ──────────────────────────────────────────────────
    let (coordinator_url, discovery) = locate_coordinator(&config).await;
    let upload_url = config.resolved_upload_url(&coordinator_url);
    info!(
        "syncam agent starting (coordinator={coordinator_url}, uploads={upload_url}, window={}s)",
        config.segment_secs
    );

    // ── capture pipeline ─────────────────────────────────────────────
    let scratch = std::env::temp_dir().join(format!("syncam-agent-{}", std::process::id()));
    let source = FfmpegSource::from_config(&config, scratch.clone())?;
    let buffer = RollingBuffer::new(source, Timing::new(config.segment_length(), config.overlap()));
    let uploader = HttpUploader::new(&upload_url)?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let agent = Arc::new(DeviceAgent::new(
        buffer,
        uploader,
        AgentSettings {
            label: config.device_label.clone(),
            has_aux_light: config.has_aux_light,
            light_pulse: Duration::from_millis(config.light_pulse_ms),
        },
        outbound_tx,
    ));

    let status_task = tokio::spawn(agent.clone().follow_buffer(shutdown.clone()));
    let console_task = tokio::spawn(console::run(
        agent.clone(),
        BufReader::new(tokio::io::stdin()),
        shutdown.clone(),
    ));

    // ── realtime channel (runs until shutdown) ───────────────────────
    client::run(
        agent.clone(),
        coordinator_url,
        outbound_rx,
        Duration::from_secs(config.reconnect_secs),
        shutdown.clone(),
    )
    .await;

    agent.buffer().stop().await;
    console_task.abort();
    let _ = status_task.await;
    if let Some(dh) = discovery {
        dh.shutdown();
    }
    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        warn!("Cannot remove {}: {e}", scratch.display());
    }
    info!("syncam agent stopped");
    Ok(())
}

/// Coordinator URL from config, else the first one answering on mDNS,
/// else localhost.  The mDNS handle is kept alive for the agent's lifetime.
async fn locate_coordinator(config: &Config) -> (String, Option<discovery::DiscoveryHandle>) {
    if let Some(url) = &config.coordinator_url {
        return (url.clone(), None);
    }
    if std::env::var("SYNCAM_DISABLE_MDNS").is_ok() {
        info!("SYNCAM_DISABLE_MDNS set – using {FALLBACK_COORDINATOR}");
        return (FALLBACK_COORDINATOR.to_string(), None);
    }

    let found = tokio::task::spawn_blocking(|| {
        let handle = discovery::register(ServiceRole::Agent, 0)?;
        let url = handle.find_coordinator(DISCOVERY_TIMEOUT);
        Ok::<_, anyhow::Error>((url, handle))
    })
    .await;

    match found {
        Ok(Ok((Some(url), handle))) => {
            info!("Found coordinator via mDNS at {url}");
            (url, Some(handle))
        }
        Ok(Ok((None, handle))) => {
            warn!("No coordinator on mDNS, using {FALLBACK_COORDINATOR}");
            (FALLBACK_COORDINATOR.to_string(), Some(handle))
        }
        Ok(Err(e)) => {
            warn!("mDNS unavailable (non-fatal): {e:#}");
            (FALLBACK_COORDINATOR.to_string(), None)
        }
        Err(e) => {
            warn!("mDNS lookup task failed: {e}");
            (FALLBACK_COORDINATOR.to_string(), None)
        }
    }
}
