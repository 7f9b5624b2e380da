//! Vent control engine: one decision per control cycle, and the only code
//! that touches the motor outputs.
//!
//! ## Vent state machine
//!
//! ```text
//!            temp > threshold                 max-on-time elapsed
//! Closed ──────────────────────▶ Opening ───────────────────────▶ Open
//!   ▲                                                               │
//!   │ max-on-time elapsed                  temp < threshold - hyst  │
//!   └──────────────────────────── Closing ◀─────────────────────────┘
//! ```
//!
//! A Stop during Opening/Closing de-energises the motor and holds the vent
//! where it is, reported as the state it was moving toward. Every Open/Close
//! (automatic or manual) respects the cooldown since the previous one; a
//! blocked command is deferred to a later cycle, not dropped.

use std::time::{Duration, Instant};

use greenhouse_common::{
    ClockTime, ControlSettings, ManualCommand, Mode, SensorFault, SensorReading, VentState,
};
use tracing::{debug, info, warn};

use crate::motor::{Drive, Motor};
use crate::sensor::Sensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Minimum time between the starts of two actuations.
    pub cooldown: Duration,
    /// How long the motor is energised for a full open or close.
    pub max_on_time: Duration,
    /// Silence from the hub after which the unit runs autonomously.
    pub hub_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            max_on_time: Duration::from_secs(15),
            hub_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Close,
    Stop,
}

impl From<ManualCommand> for Command {
    fn from(cmd: ManualCommand) -> Self {
        match cmd {
            ManualCommand::Open => Command::Open,
            ManualCommand::Close => Command::Close,
            ManualCommand::Stop => Command::Stop,
        }
    }
}

/// What to do with a pending manual command given where the vent is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualDisposition {
    Dispatch(Command),
    /// Already there or already heading there: consume without acting.
    Noop,
    /// Moving the other way: keep it pending until the motion completes.
    Wait,
}

/// `held` means the vent was stopped part way, so a reported Open or Closed
/// is not an end stop and the same direction can still be driven.
pub fn manual_disposition(cmd: ManualCommand, vent: VentState, held: bool) -> ManualDisposition {
    use ManualDisposition::*;
    match (cmd, vent) {
        (ManualCommand::Open, VentState::Open) if held => Dispatch(Command::Open),
        (ManualCommand::Close, VentState::Closed) if held => Dispatch(Command::Close),
        (ManualCommand::Open, VentState::Closed) => Dispatch(Command::Open),
        (ManualCommand::Open, VentState::Open | VentState::Opening) => Noop,
        (ManualCommand::Open, VentState::Closing) => Wait,
        (ManualCommand::Close, VentState::Open) => Dispatch(Command::Close),
        (ManualCommand::Close, VentState::Closed | VentState::Closing) => Noop,
        (ManualCommand::Close, VentState::Opening) => Wait,
        (ManualCommand::Stop, VentState::Opening | VentState::Closing) => Dispatch(Command::Stop),
        (ManualCommand::Stop, VentState::Open | VentState::Closed) => Noop,
    }
}

/// One control decision, ignoring cooldown.
///
/// Auto mode opens only from Closed when the temperature is above the
/// threshold (and the schedule permits), and closes only from Open when it
/// is below `threshold - hysteresis` (or the schedule window has ended).
/// Without a trustworthy reading nothing is decided. Manual mode acts on the
/// pending manual command only, treating the vent as settled at an end stop.
pub fn evaluate(
    reading: Option<&SensorReading>,
    settings: &ControlSettings,
    vent: VentState,
    clock: Option<ClockTime>,
) -> Option<Command> {
    match settings.mode {
        Mode::Manual => match manual_disposition(settings.pending_manual?, vent, false) {
            ManualDisposition::Dispatch(cmd) => Some(cmd),
            ManualDisposition::Noop | ManualDisposition::Wait => None,
        },
        Mode::Auto => {
            let t = reading?.temperature_c;
            let permitted = settings.schedule.permits_opening(clock);
            match vent {
                VentState::Closed if permitted && t > settings.threshold_c => Some(Command::Open),
                VentState::Open if !permitted || t < settings.close_below_c() => {
                    Some(Command::Close)
                }
                _ => None,
            }
        }
    }
}

/// What happened during one [`Engine::cycle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// A motion that ran its full max-on-time and ended this cycle.
    pub completed: Option<VentState>,
    pub dispatched: Option<Command>,
    /// Blocked by the cooldown or by an opposite motion; retried later.
    pub deferred: Option<Command>,
    /// The pending manual command was used up and should be cleared.
    pub consumed_manual: bool,
}

pub struct Engine<M: Motor> {
    cfg: EngineConfig,
    motor: M,
    vent: VentState,
    /// Stopped part-way; `vent` then names the direction last commanded.
    held: bool,
    last_good: Option<SensorReading>,
    sensor_ok: bool,
    last_actuation: Option<Instant>,
    motion_deadline: Option<Instant>,
    last_hub_contact: Instant,
    autonomous: bool,
}

impl<M: Motor> Engine<M> {
    /// Start with the motor released and the vent assumed closed. The hub
    /// timeout is measured from `now`.
    pub fn new(cfg: EngineConfig, mut motor: M, now: Instant) -> Self {
        motor.release();
        Self {
            cfg,
            motor,
            vent: VentState::Closed,
            held: false,
            last_good: None,
            sensor_ok: false,
            last_actuation: None,
            motion_deadline: None,
            last_hub_contact: now,
            autonomous: false,
        }
    }

    pub fn vent(&self) -> VentState {
        self.vent
    }

    #[cfg(test)]
    pub fn held(&self) -> bool {
        self.held
    }

    #[cfg(test)]
    pub fn motor(&self) -> &M {
        &self.motor
    }

    pub fn last_reading(&self) -> Option<&SensorReading> {
        self.last_good.as_ref()
    }

    #[cfg(test)]
    pub fn sensor_ok(&self) -> bool {
        self.sensor_ok
    }

    #[cfg(test)]
    pub fn is_autonomous(&self) -> bool {
        self.autonomous
    }

    /// Sample and validate. A fault keeps the previous good reading and
    /// suppresses automatic decisions until the next good sample.
    pub fn read_sensor(&mut self, sensor: &mut impl Sensor) -> Result<SensorReading, SensorFault> {
        let result = sensor.sample().and_then(|r| r.validate().map(|()| r));
        match &result {
            Ok(r) => {
                if !self.sensor_ok {
                    info!(temperature = r.temperature_c, "sensor reading valid");
                }
                self.last_good = Some(*r);
                self.sensor_ok = true;
            }
            Err(fault) => {
                if self.sensor_ok || self.last_good.is_none() {
                    warn!("sensor fault, automatic control suspended: {fault}");
                }
                self.sensor_ok = false;
            }
        }
        result
    }

    /// Any frame from the hub proves it is alive.
    pub fn hub_contact(&mut self, now: Instant) {
        self.last_hub_contact = now;
        if self.autonomous {
            self.autonomous = false;
            info!("hub contact restored, leaving autonomous mode");
        }
    }

    fn check_hub(&mut self, now: Instant) {
        let silent = now.saturating_duration_since(self.last_hub_contact);
        if !self.autonomous && silent > self.cfg.hub_timeout {
            self.autonomous = true;
            warn!(
                silent_secs = silent.as_secs(),
                "no hub contact, switching to autonomous control"
            );
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.last_actuation
            .is_some_and(|at| now.saturating_duration_since(at) < self.cfg.cooldown)
    }

    /// Drive the motor. Both outputs are released before either is asserted.
    pub fn apply_command(&mut self, cmd: Command, now: Instant) {
        self.motor.release();
        match cmd {
            Command::Stop => {
                self.vent = match self.vent {
                    VentState::Opening => VentState::Open,
                    VentState::Closing => VentState::Closed,
                    settled => settled,
                };
                self.held = true;
                self.motion_deadline = None;
                info!(vent = self.vent.as_str(), "vent stopped");
            }
            Command::Open | Command::Close => {
                let (drive, state) = if cmd == Command::Open {
                    (Drive::Open, VentState::Opening)
                } else {
                    (Drive::Close, VentState::Closing)
                };
                self.motor.drive(drive);
                self.vent = state;
                self.held = false;
                self.last_actuation = Some(now);
                self.motion_deadline = Some(now + self.cfg.max_on_time);
                info!(vent = state.as_str(), "vent actuation started");
            }
        }
    }

    /// End a motion whose max-on-time has elapsed.
    fn finish_motion(&mut self, now: Instant) -> Option<VentState> {
        let deadline = self.motion_deadline?;
        if now < deadline {
            return None;
        }
        self.motor.release();
        self.motion_deadline = None;
        self.vent = match self.vent {
            VentState::Opening => VentState::Open,
            VentState::Closing => VentState::Closed,
            settled => settled,
        };
        info!(vent = self.vent.as_str(), "vent actuation complete");
        Some(self.vent)
    }

    /// Run one control cycle against `settings`. Never blocks; when in
    /// doubt the vent is left where it is.
    pub fn cycle(
        &mut self,
        settings: &ControlSettings,
        now: Instant,
        clock: Option<ClockTime>,
    ) -> CycleOutcome {
        let mut out = CycleOutcome {
            completed: self.finish_motion(now),
            ..Default::default()
        };
        self.check_hub(now);

        let mode = if self.autonomous {
            Mode::Auto
        } else {
            settings.mode
        };

        let wanted = match (mode, settings.pending_manual) {
            (Mode::Manual, Some(cmd)) => match manual_disposition(cmd, self.vent, self.held) {
                ManualDisposition::Dispatch(c) => {
                    out.consumed_manual = true;
                    Some(c)
                }
                ManualDisposition::Noop => {
                    debug!(%cmd, vent = self.vent.as_str(), "manual command already satisfied");
                    out.consumed_manual = true;
                    None
                }
                ManualDisposition::Wait => {
                    out.deferred = Some(cmd.into());
                    None
                }
            },
            (Mode::Manual, None) => None,
            (Mode::Auto, pending) => {
                if pending.is_some() && !self.autonomous {
                    debug!("dropping manual command received in auto mode");
                    out.consumed_manual = true;
                }
                let reading = if self.sensor_ok {
                    self.last_good.as_ref()
                } else {
                    None
                };
                let auto = ControlSettings {
                    mode: Mode::Auto,
                    ..*settings
                };
                evaluate(reading, &auto, self.vent, clock)
            }
        };

        let Some(cmd) = wanted else {
            return out;
        };

        if cmd != Command::Stop && self.cooling_down(now) {
            debug!(?cmd, "actuation deferred by cooldown");
            out.deferred = Some(cmd);
            if mode == Mode::Manual {
                out.consumed_manual = false;
            }
            return out;
        }

        self.apply_command(cmd, now);
        out.dispatched = Some(cmd);
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================
