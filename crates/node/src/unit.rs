//! One greenhouse unit: its persisted settings, its control engine and the
//! handling of frames heard on the downlink.

use std::time::Instant;

use greenhouse_common::store::SettingsStore;
use greenhouse_common::{
    ClockTime, ControlSettings, Frame, SensorReading, SettingsError, SettingsPatch,
    TelemetryMessage, UnitId,
};
use tracing::{debug, info, warn};

use crate::engine::{CycleOutcome, Engine};
use crate::motor::Motor;
use crate::sensor::Sensor;

/// Slot holding this unit's settings in its own store.
const SETTINGS_SLOT: usize = 0;

/// What a received frame did to the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Addressed to us and the settings changed.
    Applied,
    /// Addressed to us, nothing new.
    Unchanged,
    /// Addressed to us but invalid; settings untouched.
    Rejected,
    /// Another unit's frame, or uplink traffic.
    Ignored,
}

pub struct Unit<M: Motor> {
    id: UnitId,
    settings: ControlSettings,
    engine: Engine<M>,
    store: SettingsStore,
    started: Instant,
}

impl<M: Motor> Unit<M> {
    /// Restore settings from the store (falling back to defaults) and take
    /// ownership of the engine.
    pub fn new(id: UnitId, engine: Engine<M>, mut store: SettingsStore, now: Instant) -> Self {
        let settings = store.load(SETTINGS_SLOT);
        info!(
            unit = %id,
            threshold = settings.threshold_c,
            hysteresis = settings.hysteresis_c,
            mode = settings.mode.as_str(),
            "unit settings restored"
        );
        Self {
            id,
            settings,
            engine,
            store,
            started: now,
        }
    }

    #[cfg(test)]
    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    #[cfg(test)]
    pub fn engine(&self) -> &Engine<M> {
        &self.engine
    }

    /// The single way settings change on a unit. Rejects the whole patch on
    /// any invalid field; persists only when something changed.
    pub fn apply_settings(&mut self, patch: &SettingsPatch) -> Result<bool, SettingsError> {
        let changed = self.settings.apply(patch)?;
        if changed {
            self.persist();
        }
        Ok(changed)
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.save(SETTINGS_SLOT, &self.settings) {
            warn!(unit = %self.id, "persisting settings failed: {e}");
        }
    }

    /// Handle one decoded downlink frame. Any downlink traffic counts as hub
    /// contact, even when addressed to another unit.
    pub fn on_frame(&mut self, frame: &Frame, now: Instant) -> FrameOutcome {
        let patch = match frame {
            Frame::Telemetry(_) => return FrameOutcome::Ignored,
            Frame::Control(c) => (c.target, c.to_patch()),
            Frame::Schedule(s) => (s.target, s.to_patch()),
        };
        self.engine.hub_contact(now);

        let (target, patch) = patch;
        if !target.accepts(self.id) {
            return FrameOutcome::Ignored;
        }

        match self.apply_settings(&patch) {
            Ok(true) => {
                info!(unit = %self.id, %target, "settings updated from hub");
                FrameOutcome::Applied
            }
            Ok(false) => {
                debug!(unit = %self.id, "hub settings unchanged");
                FrameOutcome::Unchanged
            }
            Err(e) => {
                warn!(unit = %self.id, "rejected settings from hub: {e}");
                FrameOutcome::Rejected
            }
        }
    }

    /// Sample the sensor and run one engine cycle.
    pub fn control_cycle(
        &mut self,
        sensor: &mut impl Sensor,
        now: Instant,
        clock: Option<ClockTime>,
    ) -> CycleOutcome {
        // Faults are logged by the engine and only suspend auto decisions.
        let _ = self.engine.read_sensor(sensor);
        let out = self.engine.cycle(&self.settings, now, clock);
        if out.consumed_manual && self.settings.pending_manual.take().is_some() {
            self.persist();
        }
        sensor.observe_vent(self.engine.vent());
        out
    }

    /// Status report for the hub. Carries the last good reading; before the
    /// first good reading the values are NaN so the hub still sees the unit
    /// alive without storing a reading.
    pub fn telemetry(&self, now: Instant) -> TelemetryMessage {
        let timestamp_ms = now.saturating_duration_since(self.started).as_millis() as u32;
        let reading = match self.engine.last_reading() {
            Some(r) => SensorReading { timestamp_ms, ..*r },
            None => SensorReading {
                temperature_c: f32::NAN,
                humidity_pct: f32::NAN,
                pressure_hpa: f32::NAN,
                timestamp_ms,
            },
        };
        TelemetryMessage {
            unit: self.id,
            reading,
            vent: self.engine.vent(),
        }
    }
}

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::engine::{Command, EngineConfig};
    use crate::motor::VentMotor;
    use greenhouse_common::record;
    use greenhouse_common::store::MemoryBackend;
    use greenhouse_common::{
        Address, ControlMessage, ManualCommand, Mode, Schedule, ScheduleMessage, SensorFault,
        VentState,
    };
    use std::time::Duration;

    struct Fixed(f32);

    impl Sensor for Fixed {
        fn sample(&mut self) -> Result<SensorReading, SensorFault> {
            Ok(SensorReading {
                temperature_c: self.0,
                humidity_pct: 50.0,
                pressure_hpa: 1000.0,
                timestamp_ms: 0,
            })
        }
    }

    fn id(n: u8) -> UnitId {
        UnitId::new(n).unwrap()
    }

    fn unit(backend: &MemoryBackend, t0: Instant) -> Unit<VentMotor> {
        let engine = Engine::new(EngineConfig::default(), VentMotor::default(), t0);
        Unit::new(id(2), engine, SettingsStore::new(backend.clone(), 1), t0)
    }

    fn control(target: Address, threshold: f32) -> Frame {
        Frame::Control(ControlMessage {
            target,
            threshold_c: threshold,
            hysteresis_c: 1.0,
            mode: Mode::Auto,
            manual: None,
        })
    }

    #[test]
    fn restores_settings_from_store() {
        let backend = MemoryBackend::new();
        let stored = ControlSettings {
            threshold_c: 30.0,
            ..Default::default()
        };
        backend.poke(0, record::encode(&stored));
        let u = unit(&backend, Instant::now());
        assert_eq!(u.settings().threshold_c, 30.0);
    }

    #[test]
    fn unicast_to_self_is_applied_and_persisted() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let mut u = unit(&backend, t0);

        let out = u.on_frame(&control(Address::Unicast(id(2)), 28.0), t0);
        assert_eq!(out, FrameOutcome::Applied);
        assert_eq!(u.settings().threshold_c, 28.0);

        let saved = record::decode(backend.peek(0).as_ref());
        assert_eq!(saved.settings.threshold_c, 28.0);

        let again = u.on_frame(&control(Address::Unicast(id(2)), 28.0), t0);
        assert_eq!(again, FrameOutcome::Unchanged);
    }

    #[test]
    fn frame_for_other_unit_is_ignored() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let mut u = unit(&backend, t0);
        let out = u.on_frame(&control(Address::Unicast(id(3)), 28.0), t0);
        assert_eq!(out, FrameOutcome::Ignored);
        assert_eq!(u.settings().threshold_c, 25.0);
        assert!(backend.peek(0).is_none());
    }

    #[test]
    fn broadcast_is_applied() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let mut u = unit(&backend, t0);
        let out = u.on_frame(&control(Address::Broadcast, 33.0), t0);
        assert_eq!(out, FrameOutcome::Applied);
        assert_eq!(u.settings().threshold_c, 33.0);
    }

    #[test]
    fn invalid_control_frame_changes_nothing() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let mut u = unit(&backend, t0);
        let out = u.on_frame(&control(Address::Broadcast, 50.0), t0);
        assert_eq!(out, FrameOutcome::Rejected);
        assert_eq!(*u.settings(), ControlSettings::default());
    }

    #[test]
    fn schedule_frame_updates_schedule_only() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let mut u = unit(&backend, t0);
        let schedule = Schedule {
            open: ClockTime::new(6, 30).unwrap(),
            close: ClockTime::new(20, 0).unwrap(),
            enabled: true,
        };
        let frame = Frame::Schedule(ScheduleMessage {
            target: Address::Unicast(id(2)),
            schedule,
        });
        assert_eq!(u.on_frame(&frame, t0), FrameOutcome::Applied);
        assert_eq!(u.settings().schedule, schedule);
        assert_eq!(u.settings().threshold_c, 25.0);
    }

    #[test]
    fn other_units_traffic_keeps_hub_contact_alive() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let mut u = unit(&backend, t0);
        u.on_frame(&control(Address::Unicast(id(5)), 28.0), t0 + Duration::from_secs(250));
        u.control_cycle(&mut Fixed(20.0), t0 + Duration::from_secs(400), None);
        assert!(!u.engine().is_autonomous());
    }

    #[test]
    fn consumed_manual_command_is_cleared_and_persisted() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let mut u = unit(&backend, t0);
        let frame = Frame::Control(ControlMessage {
            target: Address::Unicast(id(2)),
            threshold_c: 25.0,
            hysteresis_c: 0.5,
            mode: Mode::Manual,
            manual: Some(ManualCommand::Open),
        });
        u.on_frame(&frame, t0);
        assert_eq!(u.settings().pending_manual, Some(ManualCommand::Open));

        let out = u.control_cycle(&mut Fixed(10.0), t0, None);
        assert_eq!(out.dispatched, Some(Command::Open));
        assert_eq!(u.settings().pending_manual, None);
        assert_eq!(u.engine().vent(), VentState::Opening);

        let saved = record::decode(backend.peek(0).as_ref()).settings;
        assert_eq!(saved.pending_manual, None);
        assert_eq!(saved.mode, Mode::Manual);
    }

    #[test]
    fn telemetry_before_first_reading_is_nan() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let u = unit(&backend, t0);
        let msg = u.telemetry(t0);
        assert_eq!(msg.unit, id(2));
        assert!(msg.reading.temperature_c.is_nan());
        assert_eq!(msg.vent, VentState::Closed);
    }

    #[test]
    fn telemetry_carries_last_good_reading() {
        let backend = MemoryBackend::new();
        let t0 = Instant::now();
        let mut u = unit(&backend, t0);
        u.control_cycle(&mut Fixed(21.5), t0, None);
        let msg = u.telemetry(t0 + Duration::from_secs(3));
        assert_eq!(msg.reading.temperature_c, 21.5);
        assert_eq!(msg.reading.timestamp_ms, 3000);
    }
}
