//! syncam coordinator – realtime channel server for capture devices.
//!
//! This binary:
//! 1. Reads configuration from `syncam.conf`
//! 2. Resumes the capture counter from the object store
//! 3. Registers on mDNS so agents can find it
//! 4. Runs the websocket channel + upload HTTP server and the stale sweeper

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

use syncam_common::config::{self, Config};
use syncam_common::discovery::{self, ServiceRole};
use syncam_coordinator::coordinator::{Coordinator, Settings};
use syncam_coordinator::server::{self, AppState};
use syncam_coordinator::storage::LocalStore;

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

    info!(
        "syncam coordinator starting (listen={}, storage={})",
        config.listen_addr,
        config.storage_dir.display()
    );

    std::fs::create_dir_all(&config.storage_dir)
        .with_context(|| format!("Cannot create {}", config.storage_dir.display()))?;

    // ── roster state ─────────────────────────────────────────────────
    let store = LocalStore::new(&config.storage_dir);
    let counter = store.resume_counter(config.counter_baseline);
    let coordinator = Arc::new(Coordinator::new(
        Settings {
            countdown_ticks: config.countdown_ticks,
            countdown_interval: Duration::from_millis(config.countdown_interval_ms),
        },
        counter,
    ));

    // ── mDNS ─────────────────────────────────────────────────────────
    let discovery = if std::env::var("SYNCAM_DISABLE_MDNS").is_ok() {
        info!("SYNCAM_DISABLE_MDNS set – mDNS skipped");
        None
    } else {
        let port = config
            .listen_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8090);
        match discovery::register(ServiceRole::Coordinator, port) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!("mDNS registration failed (non-fatal): {e:#}");
                None
            }
        }
    };

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── stale sweeper ────────────────────────────────────────────────
    let sweeper = tokio::spawn(
        coordinator
            .clone()
            .run_sweeper(Duration::from_secs(config.sweep_interval_secs)),
    );

    // ── HTTP + websocket server ──────────────────────────────────────
    let state = AppState {
        coordinator,
        store,
        start_time: Instant::now(),
        ping_interval: Duration::from_secs(config.ping_interval_secs),
    };
    if let Err(e) = server::run(state, &config.listen_addr, shutdown).await {
        tracing::error!("HTTP server error: {e:#}");
    }

    sweeper.abort();
    if let Some(dh) = discovery {
        dh.shutdown();
    }
    info!("syncam coordinator stopped");
    Ok(())
}
