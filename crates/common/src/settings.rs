//! Per-unit control settings and the single validating entry point through
//! which every source (operator, hub, cloud) changes them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

use crate::error::SettingsError;

pub const DEFAULT_THRESHOLD_C: f32 = 25.0;
pub const DEFAULT_HYSTERESIS_C: f32 = 0.5;

pub const THRESHOLD_RANGE: RangeInclusive<f32> = 15.0..=40.0;
pub const HYSTERESIS_RANGE: RangeInclusive<f32> = 0.0..=5.0;

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Manual,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Mode::Auto),
            "manual" => Some(Mode::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Manual => "manual",
        }
    }
}

/// Operator override for the vent motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManualCommand {
    Open,
    Close,
    Stop,
}

impl ManualCommand {
    /// Parse the remote-store spelling (`"open"`, `"close"`, `"stop"`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Some(ManualCommand::Open),
            "close" => Some(ManualCommand::Close),
            "stop" => Some(ManualCommand::Stop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ManualCommand::Open => "open",
            ManualCommand::Close => "close",
            ManualCommand::Stop => "stop",
        }
    }

    /// Wire/record byte: `'O'`, `'C'`, `'S'`.
    pub fn to_byte(self) -> u8 {
        match self {
            ManualCommand::Open => b'O',
            ManualCommand::Close => b'C',
            ManualCommand::Stop => b'S',
        }
    }

    /// Inverse of [`ManualCommand::to_byte`]; `Ok(None)` for the "no
    /// command" byte `0`.
    pub fn from_byte(b: u8) -> Result<Option<Self>, u8> {
        match b {
            0 => Ok(None),
            b'O' => Ok(Some(ManualCommand::Open)),
            b'C' => Ok(Some(ManualCommand::Close)),
            b'S' => Ok(Some(ManualCommand::Stop)),
            other => Err(other),
        }
    }
}

impl fmt::Display for ManualCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock minute of the day, `0..1440`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    fn minute_of_day(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub open: ClockTime,
    pub close: ClockTime,
    pub enabled: bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            open: ClockTime { hour: 8, minute: 0 },
            close: ClockTime {
                hour: 18,
                minute: 0,
            },
            enabled: false,
        }
    }
}

impl Schedule {
    /// Whether automatic control may open the vent at `now`.
    ///
    /// A disabled schedule, or an unknown wall clock, never restricts
    /// anything. The window is `[open, close)` and wraps past midnight when
    /// `close < open`; `open == close` is an empty window.
    pub fn permits_opening(&self, now: Option<ClockTime>) -> bool {
        let Some(now) = now else {
            return true;
        };
        if !self.enabled {
            return true;
        }
        let (open, close, t) = (
            self.open.minute_of_day(),
            self.close.minute_of_day(),
            now.minute_of_day(),
        );
        if open <= close {
            open <= t && t < close
        } else {
            t >= open || t < close
        }
    }
}

// ---------------------------------------------------------------------------
// Settings + patch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlSettings {
    pub threshold_c: f32,
    pub hysteresis_c: f32,
    pub mode: Mode,
    pub pending_manual: Option<ManualCommand>,
    pub schedule: Schedule,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            threshold_c: DEFAULT_THRESHOLD_C,
            hysteresis_c: DEFAULT_HYSTERESIS_C,
            mode: Mode::Auto,
            pending_manual: None,
            schedule: Schedule::default(),
        }
    }
}

/// A partial settings change. `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub threshold_c: Option<f32>,
    pub hysteresis_c: Option<f32>,
    pub mode: Option<Mode>,
    pub manual: Option<ManualCommand>,
    pub schedule: Option<Schedule>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }

    /// The patch that turns any settings into `s` (pending command included).
    pub fn replace_with(s: &ControlSettings) -> Self {
        Self {
            threshold_c: Some(s.threshold_c),
            hysteresis_c: Some(s.hysteresis_c),
            mode: Some(s.mode),
            manual: s.pending_manual,
            schedule: Some(s.schedule),
        }
    }

    fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(t) = self.threshold_c {
            if !THRESHOLD_RANGE.contains(&t) {
                errors.push(format!(
                    "threshold {t} out of range [{}, {}]",
                    THRESHOLD_RANGE.start(),
                    THRESHOLD_RANGE.end()
                ));
            }
        }
        if let Some(h) = self.hysteresis_c {
            if !HYSTERESIS_RANGE.contains(&h) {
                errors.push(format!(
                    "hysteresis {h} out of range [{}, {}]",
                    HYSTERESIS_RANGE.start(),
                    HYSTERESIS_RANGE.end()
                ));
            }
        }
        if let Some(s) = &self.schedule {
            for (name, t) in [("open", s.open), ("close", s.close)] {
                if ClockTime::new(t.hour, t.minute).is_none() {
                    errors.push(format!(
                        "schedule {name} time {}:{} is not a valid time of day",
                        t.hour, t.minute
                    ));
                }
            }
        }

        errors
    }
}

impl ControlSettings {
    /// Validate and apply `patch`. Either every field is applied or none is.
    /// Returns whether anything actually changed.
    pub fn apply(&mut self, patch: &SettingsPatch) -> Result<bool, SettingsError> {
        let violations = patch.violations();
        if !violations.is_empty() {
            return Err(SettingsError { violations });
        }

        let before = *self;
        if let Some(t) = patch.threshold_c {
            self.threshold_c = t;
        }
        if let Some(h) = patch.hysteresis_c {
            self.hysteresis_c = h;
        }
        if let Some(m) = patch.mode {
            self.mode = m;
        }
        if let Some(cmd) = patch.manual {
            self.pending_manual = Some(cmd);
        }
        if let Some(s) = patch.schedule {
            self.schedule = s;
        }
        Ok(*self != before)
    }

    /// Temperature at or below which an open vent closes.
    pub fn close_below_c(&self) -> f32 {
        self.threshold_c - self.hysteresis_c
    }

    /// Whether every field sits inside its documented bounds.
    pub fn is_within_bounds(&self) -> bool {
        SettingsPatch::replace_with(self).violations().is_empty()
    }
}
