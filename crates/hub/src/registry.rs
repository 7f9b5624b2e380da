//! What the hub knows about each unit: last reading, vent position,
//! liveness and the hub's copy of its settings. Also keeps the
//! operator-facing event ring.

use greenhouse_common::{
    ControlSettings, ManualCommand, SensorReading, TelemetryMessage, UnitId, VentState, MAX_UNITS,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedRegistry = Arc<RwLock<Registry>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct UnitRecord {
    pub name: String,
    pub settings: ControlSettings,
    /// Last valid reading; invalid telemetry never overwrites it.
    pub reading: Option<SensorReading>,
    pub vent: VentState,
    pub online: bool,
    pub last_seen: Option<Instant>,
    pub last_seen_at: Option<OffsetDateTime>,
    /// Settings changed on the hub since they were last uploaded.
    pub dirty: bool,
}

impl UnitRecord {
    fn new(name: String, settings: ControlSettings) -> Self {
        Self {
            name,
            settings,
            reading: None,
            vent: VentState::Closed,
            online: false,
            last_seen: None,
            last_seen_at: None,
            dirty: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlAllStamp {
    pub action: ManualCommand,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Command,
    Online,
    Sync,
    Error,
    System,
}

/// Result of feeding one telemetry frame to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryOutcome {
    /// Not a configured unit; dropped.
    Unknown,
    Updated { came_online: bool },
}

pub struct Registry {
    started_at: Instant,
    pub mqtt_connected: bool,
    offline_timeout: Duration,
    units: [Option<UnitRecord>; MAX_UNITS],
    events: VecDeque<SystemEvent>,
    /// Global action waiting to be stamped in the remote store.
    pub control_all: Option<ControlAllStamp>,
    pub last_sync: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    pub units: Vec<UnitStatus>,
    pub events: Vec<SystemEvent>,
}

#[derive(Serialize)]
pub struct UnitStatus {
    pub unit_id: UnitId,
    pub name: String,
    pub online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub reading: Option<SensorReading>,
    pub vent: VentState,
    pub settings: ControlSettings,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Registry {
    pub fn new(units: Vec<(UnitId, String, ControlSettings)>, offline_timeout: Duration) -> Self {
        let mut table: [Option<UnitRecord>; MAX_UNITS] = Default::default();
        for (id, name, settings) in units {
            table[id.index()] = Some(UnitRecord::new(name, settings));
        }
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            offline_timeout,
            units: table,
            events: VecDeque::with_capacity(MAX_EVENTS),
            control_all: None,
            last_sync: None,
        }
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn unit(&self, id: UnitId) -> Option<&UnitRecord> {
        self.units[id.index()].as_ref()
    }

    pub fn unit_mut(&mut self, id: UnitId) -> Option<&mut UnitRecord> {
        self.units[id.index()].as_mut()
    }

    /// Every configured unit, in id order.
    pub fn configured(&self) -> Vec<UnitId> {
        UnitId::all().filter(|id| self.unit(*id).is_some()).collect()
    }

    pub fn online(&self) -> Vec<UnitId> {
        UnitId::all()
            .filter(|id| self.unit(*id).is_some_and(|u| u.online))
            .collect()
    }

    /// Apply one telemetry frame. The whole record is updated under the
    /// caller's write lock, so readers never see half of it.
    pub fn on_telemetry(&mut self, msg: &TelemetryMessage, now: Instant) -> TelemetryOutcome {
        let Some(rec) = self.units[msg.unit.index()].as_mut() else {
            tracing::debug!(unit = %msg.unit, "telemetry from unconfigured unit dropped");
            return TelemetryOutcome::Unknown;
        };

        let reading = match msg.reading.validate() {
            Ok(()) => {
                rec.reading = Some(msg.reading);
                true
            }
            Err(fault) => {
                tracing::debug!(unit = %msg.unit, "keeping previous reading: {fault}");
                false
            }
        };
        rec.vent = msg.vent;
        rec.last_seen = Some(now);
        rec.last_seen_at = Some(OffsetDateTime::now_utc());
        let came_online = !rec.online;
        rec.online = true;

        let name = rec.name.clone();
        if came_online {
            self.push_event(EventKind::Online, format!("unit {} ({name}) online", msg.unit));
        }
        if reading {
            self.push_event(
                EventKind::Telemetry,
                format!(
                    "unit {}: {:.1}C {:.0}% {:.0}hPa vent {}",
                    msg.unit,
                    msg.reading.temperature_c,
                    msg.reading.humidity_pct,
                    msg.reading.pressure_hpa,
                    msg.vent.as_str()
                ),
            );
        }
        TelemetryOutcome::Updated { came_online }
    }

    /// Mark units unseen for longer than the offline timeout as offline.
    /// Returns only the units that went offline during this sweep.
    pub fn check_liveness(&mut self, now: Instant) -> Vec<UnitId> {
        let mut dropped = Vec::new();
        for id in UnitId::all() {
            let Some(rec) = self.units[id.index()].as_mut() else {
                continue;
            };
            if !rec.online {
                continue;
            }
            let stale = rec
                .last_seen
                .map_or(true, |seen| now.saturating_duration_since(seen) > self.offline_timeout);
            if stale {
                rec.online = false;
                dropped.push((id, rec.name.clone()));
            }
        }
        for (id, name) in &dropped {
            tracing::warn!(unit = %id, "unit offline");
            self.push_event(
                EventKind::Error,
                format!(
                    "unit {id} ({name}) offline: no telemetry for {}s",
                    self.offline_timeout.as_secs()
                ),
            );
        }
        dropped.into_iter().map(|(id, _)| id).collect()
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_sync(&mut self, detail: String) {
        self.push_event(EventKind::Sync, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        let units = UnitId::all()
            .filter_map(|id| {
                self.unit(id).map(|u| UnitStatus {
                    unit_id: id,
                    name: u.name.clone(),
                    online: u.online,
                    last_seen: u.last_seen_at,
                    reading: u.reading,
                    vent: u.vent,
                    settings: u.settings,
                })
            })
            .collect();
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            last_sync: self.last_sync,
            units,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
