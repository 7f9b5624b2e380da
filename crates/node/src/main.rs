mod engine;
mod motor;
mod sensor;
mod unit;

#[cfg(not(feature = "sim"))]
compile_error!("greenhouse-node has no hardware sensor driver yet; build with the `sim` feature");

use anyhow::{bail, Context, Result};
use greenhouse_common::link::{Direction, Link, MqttLink, DOWNLINK_TOPIC};
use greenhouse_common::store::{FileBackend, SettingsStore};
use greenhouse_common::timer::Scheduler;
use greenhouse_common::{ClockTime, Frame, UnitId};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::path::PathBuf;
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use engine::{Engine, EngineConfig};
use motor::VentMotor;
use sensor::{Scenario, SimSensor};
use unit::Unit;

/// Everything the node reads from its environment, validated up front.
#[derive(Debug, Clone, PartialEq)]
struct NodeConfig {
    unit: UnitId,
    mqtt_host: String,
    mqtt_port: u16,
    settings_path: PathBuf,
    control_every: Duration,
    telemetry_every: Duration,
    engine: EngineConfig,
    tz_offset_min: i32,
    scenario: Scenario,
    sim_day: Duration,
    open_gpio: u8,
    close_gpio: u8,
    relay_active_low: bool,
}

impl NodeConfig {
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Every problem is reported at once.
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut errors = Vec::new();

        fn num<T: std::str::FromStr>(
            get: &impl Fn(&str) -> Option<String>,
            errors: &mut Vec<String>,
            key: &str,
            default: T,
        ) -> T {
            match get(key) {
                None => default,
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    errors.push(format!("{key}: cannot parse {raw:?}"));
                    default
                }),
            }
        }

        let raw_id: u8 = num(&get, &mut errors, "NODE_ID", 1);
        let unit = UnitId::new(raw_id);
        if unit.is_none() {
            errors.push(format!("NODE_ID: {raw_id} is not a unit id (1..=6)"));
        }

        let control_ms: u64 = num(&get, &mut errors, "CONTROL_EVERY_MS", 2000);
        let telemetry_s: u64 = num(&get, &mut errors, "TELEMETRY_EVERY_S", 10);
        let cooldown_s: u64 = num(&get, &mut errors, "COOLDOWN_S", 60);
        let max_on_s: u64 = num(&get, &mut errors, "MAX_ON_S", 15);
        let hub_timeout_s: u64 = num(&get, &mut errors, "HUB_TIMEOUT_S", 300);
        let sim_day_s: u64 = num(&get, &mut errors, "SIM_DAY_S", 86_400);

        for (key, value) in [
            ("CONTROL_EVERY_MS", control_ms),
            ("TELEMETRY_EVERY_S", telemetry_s),
            ("MAX_ON_S", max_on_s),
            ("HUB_TIMEOUT_S", hub_timeout_s),
            ("SIM_DAY_S", sim_day_s),
        ] {
            if value == 0 {
                errors.push(format!("{key}: must be positive"));
            }
        }
        if cooldown_s < max_on_s {
            errors.push(format!(
                "COOLDOWN_S ({cooldown_s}) must be at least MAX_ON_S ({max_on_s})"
            ));
        }

        let tz_offset_min: i32 = num(&get, &mut errors, "TZ_OFFSET_MIN", 0);
        if tz_offset_min.abs() > 14 * 60 {
            errors.push(format!("TZ_OFFSET_MIN: {tz_offset_min} is not a UTC offset"));
        }

        let relay_active_low = get("RELAY_ACTIVE_LOW")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let mqtt_port: u16 = num(&get, &mut errors, "MQTT_PORT", 1883);
        let open_gpio: u8 = num(&get, &mut errors, "OPEN_GPIO", 17);
        let close_gpio: u8 = num(&get, &mut errors, "CLOSE_GPIO", 27);

        let Some(unit) = unit.filter(|_| errors.is_empty()) else {
            bail!("invalid node configuration:\n  - {}", errors.join("\n  - "));
        };

        Ok(Self {
            unit,
            mqtt_host: get("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port,
            settings_path: get("SETTINGS_PATH")
                .unwrap_or_else(|| "node-settings.bin".to_string())
                .into(),
            control_every: Duration::from_millis(control_ms),
            telemetry_every: Duration::from_secs(telemetry_s),
            engine: EngineConfig {
                cooldown: Duration::from_secs(cooldown_s),
                max_on_time: Duration::from_secs(max_on_s),
                hub_timeout: Duration::from_secs(hub_timeout_s),
            },
            tz_offset_min,
            scenario: Scenario::from_str_lossy(&get("SIM_SCENARIO").unwrap_or_default()),
            sim_day: Duration::from_secs(sim_day_s),
            open_gpio,
            close_gpio,
            relay_active_low,
        })
    }

    /// Local wall-clock time of day, for the schedule window.
    fn clock(&self) -> Option<ClockTime> {
        let utc = time::OffsetDateTime::now_utc();
        let local = utc.checked_add(time::Duration::minutes(self.tz_offset_min.into()))?;
        ClockTime::new(local.hour(), local.minute())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Control,
    Telemetry,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = NodeConfig::from_env()?;
    info!(
        unit = %cfg.unit,
        scenario = %cfg.scenario,
        settings = %cfg.settings_path.display(),
        "node starting"
    );

    // ── Hardware + persistence ──────────────────────────────────────
    let motor = VentMotor::new(cfg.open_gpio, cfg.close_gpio, cfg.relay_active_low)
        .context("initialising vent motor outputs")?;
    let store = SettingsStore::new(FileBackend::new(&cfg.settings_path, 1), 1);
    let mut sensor = SimSensor::new(cfg.scenario, cfg.sim_day.as_secs_f64());

    let boot = std::time::Instant::now();
    let engine = Engine::new(cfg.engine, motor, boot);
    let mut unit = Unit::new(cfg.unit, engine, store, boot);

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(
        format!("greenhouse-node-{}", cfg.unit),
        cfg.mqtt_host.clone(),
        cfg.mqtt_port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let link = MqttLink::new(client.clone(), Direction::Uplink);

    let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(32);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to mqtt");
                    // Re-subscribe after every reconnect; clean sessions
                    // forget subscriptions.
                    if let Err(e) = client.try_subscribe(DOWNLINK_TOPIC, QoS::AtMostOnce) {
                        error!("subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if Direction::from_topic(&p.topic) != Some(Direction::Downlink) {
                        continue;
                    }
                    match Frame::decode(&p.payload) {
                        Ok(frame) => {
                            if frames_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("dropping undecodable frame: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // ── Driver loop ─────────────────────────────────────────────────
    let mut tasks = Scheduler::new();
    tasks
        .every_from_now(Task::Control, cfg.control_every, boot)
        .every(Task::Telemetry, cfg.telemetry_every, boot);

    loop {
        let deadline = tasks
            .next_deadline()
            .unwrap_or_else(|| std::time::Instant::now() + cfg.control_every);

        tokio::select! {
            _ = sleep_until(Instant::from_std(deadline)) => {
                let now = std::time::Instant::now();
                for task in tasks.due(now) {
                    match task {
                        Task::Control => {
                            unit.control_cycle(&mut sensor, now, cfg.clock());
                        }
                        Task::Telemetry => {
                            let msg = unit.telemetry(now);
                            match link.send(&Frame::Telemetry(msg)).await {
                                Ok(()) => debug!(
                                    temperature = msg.reading.temperature_c,
                                    vent = msg.vent.as_str(),
                                    "telemetry sent"
                                ),
                                Err(e) => warn!("telemetry not sent: {e}"),
                            }
                        }
                    }
                }
            }
            frame = frames_rx.recv() => {
                let Some(frame) = frame else {
                    error!("mqtt task ended");
                    break;
                };
                unit.on_frame(&frame, std::time::Instant::now());
            }
        }
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let cfg = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.unit.get(), 1);
        assert_eq!(cfg.mqtt_port, 1883);
        assert_eq!(cfg.control_every, Duration::from_secs(2));
        assert_eq!(cfg.telemetry_every, Duration::from_secs(10));
        assert_eq!(cfg.engine, EngineConfig::default());
        assert_eq!(cfg.scenario, Scenario::Sunny);
        assert!(cfg.relay_active_low);
    }

    #[test]
    fn reads_overrides() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("NODE_ID", "4"),
            ("MQTT_HOST", "broker.local"),
            ("COOLDOWN_S", "90"),
            ("SIM_SCENARIO", "hot"),
            ("TZ_OFFSET_MIN", "-300"),
        ]))
        .unwrap();
        assert_eq!(cfg.unit.get(), 4);
        assert_eq!(cfg.mqtt_host, "broker.local");
        assert_eq!(cfg.engine.cooldown, Duration::from_secs(90));
        assert_eq!(cfg.scenario, Scenario::Hot);
        assert_eq!(cfg.tz_offset_min, -300);
    }

    #[test]
    fn reports_every_problem_at_once() {
        let err = NodeConfig::from_lookup(lookup(&[
            ("NODE_ID", "9"),
            ("CONTROL_EVERY_MS", "0"),
            ("COOLDOWN_S", "5"),
            ("MQTT_PORT", "http"),
        ]))
        .unwrap_err()
        .to_string();
        assert!(err.contains("NODE_ID"), "{err}");
        assert!(err.contains("CONTROL_EVERY_MS"), "{err}");
        assert!(err.contains("COOLDOWN_S"), "{err}");
        assert!(err.contains("MQTT_PORT"), "{err}");
    }

    #[test]
    fn clock_is_a_valid_time_of_day() {
        let cfg = NodeConfig::from_lookup(lookup(&[("TZ_OFFSET_MIN", "330")])).unwrap();
        let clock = cfg.clock().unwrap();
        assert!(clock.hour < 24 && clock.minute < 60);
    }
}
