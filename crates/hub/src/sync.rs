//! Two-way reconciliation between the hub and the remote store.
//!
//! Remote layout, one subtree per unit:
//!
//! ```text
//! greenhouses/{id}/name
//! greenhouses/{id}/currentData  {nodeId, temperature, humidity, pressure, ventStatus, timestamp}
//! greenhouses/{id}/settings     {temperatureThreshold, hysteresis, mode, manualControl,
//!                                scheduleOpenHour, scheduleOpenMinute,
//!                                scheduleCloseHour, scheduleCloseMinute, scheduleEnabled}
//! system                        {lastSync, hubStatus, controlAll,
//!                                lastControlAll{action, timestamp}}
//! ```
//!
//! A cycle uploads first, then downloads. Settings are uploaded only when
//! the hub changed them since the last upload, so a dashboard edit made
//! between cycles is downloaded instead of overwritten. Each unit is handled
//! on its own; a failure is logged and the next unit still runs.

use greenhouse_common::{
    ClockTime, ControlSettings, ManualCommand, Mode, Schedule, SettingsPatch, UnitId,
};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cloud::{RemoteError, RemoteStore};
use crate::router::{Router, Source};

fn unit_path(id: UnitId, leaf: &str) -> String {
    format!("greenhouses/{id}/{leaf}")
}

fn rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_default()
}

/// Measurements and thresholds are written to two decimals, so the remote
/// copy shows `22.3` rather than the widened `22.299999237060547`.
fn two_decimals(x: f32) -> f64 {
    (f64::from(x) * 100.0).round() / 100.0
}

/// Equal as far as the remote copy can tell.
fn same_remotely(a: f32, b: f32) -> bool {
    two_decimals(a) == two_decimals(b)
}

/// What one sync cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    /// Units whose hub settings changed because of remote data.
    pub applied: usize,
    pub manual_dispatched: usize,
    pub failures: usize,
}

// ---------------------------------------------------------------------------
// Remote settings <-> hub settings
// ---------------------------------------------------------------------------

/// Settings fields as found remotely. Every field is optional and read
/// leniently: a missing or mistyped field is simply not compared.
#[derive(Debug, Default, Clone, PartialEq)]
struct RemoteSettings {
    threshold_c: Option<f32>,
    hysteresis_c: Option<f32>,
    mode: Option<String>,
    manual_control: Option<String>,
    open_hour: Option<u8>,
    open_minute: Option<u8>,
    close_hour: Option<u8>,
    close_minute: Option<u8>,
    schedule_enabled: Option<bool>,
}

impl RemoteSettings {
    fn from_json(v: &Value) -> Self {
        let f = |k: &str| v.get(k).and_then(Value::as_f64).map(|x| x as f32);
        let byte = |k: &str| {
            v.get(k)
                .and_then(Value::as_u64)
                .map(|x| u8::try_from(x).unwrap_or(u8::MAX))
        };
        let s = |k: &str| v.get(k).and_then(Value::as_str).map(str::to_string);
        Self {
            threshold_c: f("temperatureThreshold"),
            hysteresis_c: f("hysteresis"),
            mode: s("mode"),
            manual_control: s("manualControl"),
            open_hour: byte("scheduleOpenHour"),
            open_minute: byte("scheduleOpenMinute"),
            close_hour: byte("scheduleCloseHour"),
            close_minute: byte("scheduleCloseMinute"),
            schedule_enabled: v.get("scheduleEnabled").and_then(Value::as_bool),
        }
    }

    /// The patch that makes `hub` match the remote fields that differ.
    /// `manualControl` is not part of it; it is handled on its own.
    fn diff(&self, hub: &ControlSettings) -> SettingsPatch {
        let mut patch = SettingsPatch::default();

        if let Some(t) = self.threshold_c.filter(|t| !same_remotely(*t, hub.threshold_c)) {
            patch.threshold_c = Some(t);
        }
        if let Some(h) = self.hysteresis_c.filter(|h| !same_remotely(*h, hub.hysteresis_c)) {
            patch.hysteresis_c = Some(h);
        }
        match self.mode.as_deref().map(Mode::parse) {
            Some(Some(m)) if m != hub.mode => patch.mode = Some(m),
            Some(None) => warn!(mode = ?self.mode, "ignoring unrecognised remote mode"),
            _ => {}
        }

        // Out-of-range times are passed through so validation rejects them.
        let remote = Schedule {
            open: ClockTime {
                hour: self.open_hour.unwrap_or(hub.schedule.open.hour),
                minute: self.open_minute.unwrap_or(hub.schedule.open.minute),
            },
            close: ClockTime {
                hour: self.close_hour.unwrap_or(hub.schedule.close.hour),
                minute: self.close_minute.unwrap_or(hub.schedule.close.minute),
            },
            enabled: self.schedule_enabled.unwrap_or(hub.schedule.enabled),
        };
        if remote != hub.schedule {
            patch.schedule = Some(remote);
        }

        patch
    }
}

fn settings_json(s: &ControlSettings) -> Value {
    json!({
        "temperatureThreshold": two_decimals(s.threshold_c),
        "hysteresis": two_decimals(s.hysteresis_c),
        "mode": s.mode.as_str(),
        "scheduleOpenHour": s.schedule.open.hour,
        "scheduleOpenMinute": s.schedule.open.minute,
        "scheduleCloseHour": s.schedule.close.hour,
        "scheduleCloseMinute": s.schedule.close.minute,
        "scheduleEnabled": s.schedule.enabled,
    })
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Run one upload-then-download cycle.
pub async fn run_once(router: &mut Router, remote: &dyn RemoteStore) -> SyncReport {
    let mut report = SyncReport::default();
    upload(router, remote, &mut report).await;
    download(router, remote, &mut report).await;

    let summary = format!(
        "sync: {} uploaded, {} applied, {} manual, {} failed",
        report.uploaded, report.applied, report.manual_dispatched, report.failures
    );
    if report.failures > 0 {
        warn!("{summary}");
    } else {
        info!("{summary}");
    }
    router.registry().write().await.record_sync(summary);
    report
}

struct UnitSnapshot {
    id: UnitId,
    name: String,
    online: bool,
    dirty: bool,
    settings: ControlSettings,
    current: Option<Value>,
}

async fn upload(router: &Router, remote: &dyn RemoteStore, report: &mut SyncReport) {
    let (units, control_all) = {
        let reg = router.registry().read().await;
        let units: Vec<UnitSnapshot> = reg
            .configured()
            .into_iter()
            .filter_map(|id| {
                let u = reg.unit(id)?;
                let current = u.reading.map(|r| {
                    json!({
                        "nodeId": id.get(),
                        "temperature": two_decimals(r.temperature_c),
                        "humidity": two_decimals(r.humidity_pct),
                        "pressure": two_decimals(r.pressure_hpa),
                        "ventStatus": u.vent.to_wire(),
                        "timestamp": r.timestamp_ms,
                    })
                });
                Some(UnitSnapshot {
                    id,
                    name: u.name.clone(),
                    online: u.online,
                    dirty: u.dirty,
                    settings: u.settings,
                    current,
                })
            })
            .collect();
        (units, reg.control_all)
    };

    for unit in units {
        if unit.online {
            if let Some(current) = &unit.current {
                match remote.put(&unit_path(unit.id, "currentData"), current).await {
                    Ok(()) => report.uploaded += 1,
                    Err(e) => fail(router, report, unit.id, "currentData upload", e).await,
                }
            }
        }

        if unit.dirty {
            let body = json!({
                "name": unit.name,
                "settings": settings_json(&unit.settings),
            });
            // Nested patch would replace `settings` wholesale and drop a
            // pending manualControl, so write the two children separately.
            let result = match remote.put(&unit_path(unit.id, "name"), &body["name"]).await {
                Ok(()) => {
                    remote
                        .patch(&unit_path(unit.id, "settings"), &body["settings"])
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    let mut reg = router.registry().write().await;
                    if let Some(rec) = reg.unit_mut(unit.id) {
                        // Only clear if nothing changed while we were uploading.
                        if rec.settings == unit.settings {
                            rec.dirty = false;
                        }
                    }
                    debug!(unit = %unit.id, "settings uploaded");
                }
                Err(e) => fail(router, report, unit.id, "settings upload", e).await,
            }
        }
    }

    let now = OffsetDateTime::now_utc();
    let system = json!({ "lastSync": rfc3339(now), "hubStatus": "online" });
    if let Err(e) = remote.patch("system", &system).await {
        warn!("system status upload failed: {e}");
        report.failures += 1;
    }

    if let Some(stamp) = control_all {
        let body = json!({ "action": stamp.action.as_str(), "timestamp": rfc3339(stamp.at) });
        match remote.put("system/lastControlAll", &body).await {
            Ok(()) => {
                let mut reg = router.registry().write().await;
                if reg.control_all == Some(stamp) {
                    reg.control_all = None;
                }
            }
            Err(e) => {
                warn!("lastControlAll upload failed: {e}");
                report.failures += 1;
            }
        }
    }

    router.registry().write().await.last_sync = Some(now);
}

async fn download(router: &mut Router, remote: &dyn RemoteStore, report: &mut SyncReport) {
    let units = router.registry().read().await.configured();
    for id in units {
        if let Err(e) = download_unit(router, remote, id, report).await {
            fail(router, report, id, "settings download", e).await;
        }
    }

    match download_control_all(router, remote, report).await {
        Ok(()) => {}
        Err(e) => {
            warn!("controlAll download failed: {e}");
            report.failures += 1;
        }
    }
}

async fn download_unit(
    router: &mut Router,
    remote: &dyn RemoteStore,
    id: UnitId,
    report: &mut SyncReport,
) -> Result<(), RemoteError> {
    let path = unit_path(id, "settings");
    let Some(value) = remote.get(&path).await? else {
        // Nothing remote yet: seed it from the hub on the next upload.
        let mut reg = router.registry().write().await;
        if let Some(rec) = reg.unit_mut(id) {
            if !rec.dirty {
                info!(unit = %id, "no remote settings, seeding from hub");
                rec.dirty = true;
            }
        }
        return Ok(());
    };
    let remote_settings = RemoteSettings::from_json(&value);

    let hub = {
        let reg = router.registry().read().await;
        match reg.unit(id) {
            Some(u) => u.settings,
            None => return Ok(()),
        }
    };

    let manual = remote_settings
        .manual_control
        .as_deref()
        .map(|raw| (raw, ManualCommand::parse(raw)));

    let mut patch = remote_settings.diff(&hub);
    if manual.is_some() {
        // The command decides the mode; a stale remote mode must not undo it.
        patch.mode = None;
    }
    if !patch.is_empty() {
        match router.apply_settings(id, &patch, Source::Cloud).await {
            Ok(true) => report.applied += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(unit = %id, "remote settings rejected: {e}");
                report.failures += 1;
            }
        }
    }

    if let Some((raw, cmd)) = manual {
        let mut clear = json!({ "manualControl": null });
        match cmd {
            Some(cmd) => {
                let manual_patch = SettingsPatch {
                    mode: Some(Mode::Manual),
                    manual: Some(cmd),
                    ..Default::default()
                };
                match router.apply_settings(id, &manual_patch, Source::Cloud).await {
                    Ok(_) => {
                        report.manual_dispatched += 1;
                        clear["mode"] = json!(Mode::Manual.as_str());
                    }
                    Err(e) => warn!(unit = %id, "remote manual command failed: {e}"),
                }
            }
            None => warn!(unit = %id, value = raw, "clearing unrecognised manualControl"),
        }
        remote.patch(&path, &clear).await?;
    }

    Ok(())
}

async fn download_control_all(
    router: &mut Router,
    remote: &dyn RemoteStore,
    report: &mut SyncReport,
) -> Result<(), RemoteError> {
    let Some(value) = remote.get("system/controlAll").await? else {
        return Ok(());
    };
    match value.as_str().map(ManualCommand::parse) {
        Some(Some(action @ (ManualCommand::Open | ManualCommand::Close))) => {
            let units = router.global_action(action).await;
            report.manual_dispatched += units.len();
        }
        _ => warn!(%value, "clearing unrecognised controlAll"),
    }
    remote.put("system/controlAll", &Value::Null).await
}

async fn fail(router: &Router, report: &mut SyncReport, id: UnitId, what: &str, e: RemoteError) {
    warn!(unit = %id, "{what} failed: {e}");
    report.failures += 1;
    router
        .registry()
        .write()
        .await
        .record_error(format!("unit {id}: {what} failed: {e}"));
}

// ===========================================================================
// Tests
// ===========================================================================
