mod cloud;
mod config;
mod registry;
mod router;
mod sync;
mod uplink;
mod web;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use greenhouse_common::link::{Direction, MqttLink};
use greenhouse_common::store::{FileBackend, SettingsStore};
use greenhouse_common::timer::Scheduler;
use greenhouse_common::MAX_UNITS;
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloud::{FirebaseStore, RemoteStore};
use registry::Registry;
use router::Router;
use web::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Liveness,
    Refresh,
    Sync,
}

fn env_port(name: &str, default: u16) -> Result<u16> {
    match env::var(name) {
        Ok(s) => s
            .parse()
            .with_context(|| format!("{name} must be a port number, got {s:?}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = env_port("MQTT_PORT", 1883)?;
    let web_port = env_port("WEB_PORT", 8080)?;

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let units = cfg.unit_list();
    if units.is_empty() {
        warn!("no units configured; the hub will only serve its API");
    }

    // ── Persisted settings ──────────────────────────────────────────
    let mut store = SettingsStore::new(
        FileBackend::new(&cfg.hub.settings_path, MAX_UNITS),
        MAX_UNITS,
    );
    let units: Vec<_> = units
        .into_iter()
        .map(|(id, name)| {
            let settings = store.load(id.index());
            (id, name, settings)
        })
        .collect();
    info!(
        units = units.len(),
        settings = %cfg.hub.settings_path,
        "hub starting"
    );

    let registry = Registry::new(units, cfg.hub.offline_timeout()).shared();
    registry.write().await.record_system("hub started".to_string());

    // ── Remote store ────────────────────────────────────────────────
    let remote: Option<Box<dyn RemoteStore>> = match &cfg.cloud {
        Some(c) => {
            let firebase: Box<dyn RemoteStore> = Box::new(
                FirebaseStore::new(
                    &c.database_url,
                    c.auth_token.clone(),
                    Duration::from_secs(c.timeout_sec),
                )
                .context("building remote store client")?,
            );
            info!(url = %c.database_url, "cloud sync enabled");
            Some(firebase)
        }
        None => {
            info!("no [cloud] section, running offline");
            None
        }
    };

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("greenhouse-hub", broker, mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    let link = Arc::new(MqttLink::new(client.clone(), Direction::Downlink));

    let (telemetry_tx, mut telemetry_rx) = mpsc::channel(64);
    tokio::spawn(uplink::run(
        client,
        eventloop,
        Arc::clone(&registry),
        telemetry_tx,
    ));

    let mut router = Router::new(Arc::clone(&registry), store, link);

    // ── Web server ──────────────────────────────────────────────────
    let (ops_tx, mut ops_rx) = mpsc::channel(16);
    let web_state = AppState {
        registry: Arc::clone(&registry),
        ops: ops_tx,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("operator api stopped: {e:#}");
        }
    });

    // ── Driver loop ─────────────────────────────────────────────────
    let boot = std::time::Instant::now();
    let mut tasks = Scheduler::new();
    tasks
        .every(Task::Liveness, cfg.hub.liveness_sweep(), boot)
        .every(Task::Refresh, cfg.hub.refresh_interval(), boot);
    if remote.is_some() {
        tasks.every_from_now(Task::Sync, cfg.hub.sync_interval(), boot);
    }

    loop {
        let deadline = tasks
            .next_deadline()
            .unwrap_or_else(|| std::time::Instant::now() + cfg.hub.liveness_sweep());

        tokio::select! {
            _ = sleep_until(Instant::from_std(deadline)) => {
                let now = std::time::Instant::now();
                for task in tasks.due(now) {
                    match task {
                        Task::Liveness => {
                            let lost = router.check_liveness(now).await;
                            for unit in lost {
                                warn!(unit = %unit, "unit offline");
                            }
                        }
                        Task::Refresh => router.refresh_online().await,
                        Task::Sync => {
                            if let Some(remote) = &remote {
                                sync::run_once(&mut router, remote.as_ref()).await;
                            }
                        }
                    }
                }
            }
            msg = telemetry_rx.recv() => {
                let Some(msg) = msg else {
                    error!("uplink task ended");
                    break;
                };
                router.on_telemetry(&msg, std::time::Instant::now()).await;
            }
            Some(req) = ops_rx.recv() => {
                web::dispatch(&mut router, req).await;
            }
        }
    }

    Ok(())
}
