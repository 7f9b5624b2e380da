use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::error::SensorFault;

pub const TEMPERATURE_RANGE_C: RangeInclusive<f32> = -40.0..=85.0;
pub const HUMIDITY_RANGE_PCT: RangeInclusive<f32> = 0.0..=100.0;
pub const PRESSURE_RANGE_HPA: RangeInclusive<f32> = 300.0..=1100.0;

/// One environmental sample from a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub pressure_hpa: f32,
    /// Milliseconds since the producing unit booted.
    pub timestamp_ms: u32,
}

impl SensorReading {
    /// Reject NaN and physically impossible values.
    pub fn validate(&self) -> Result<(), SensorFault> {
        check("temperature", self.temperature_c, TEMPERATURE_RANGE_C)?;
        check("humidity", self.humidity_pct, HUMIDITY_RANGE_PCT)?;
        check("pressure", self.pressure_hpa, PRESSURE_RANGE_HPA)?;
        Ok(())
    }
}

fn check(field: &'static str, value: f32, range: RangeInclusive<f32>) -> Result<(), SensorFault> {
    if value.is_nan() {
        return Err(SensorFault::NotANumber { field });
    }
    if !range.contains(&value) {
        return Err(SensorFault::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        });
    }
    Ok(())
}

/// Position of a unit's vent motor. Advances only along
/// `Closed -> Opening -> Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VentState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
}

impl VentState {
    pub fn to_wire(self) -> u8 {
        match self {
            VentState::Closed => 0,
            VentState::Opening => 1,
            VentState::Open => 2,
            VentState::Closing => 3,
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(VentState::Closed),
            1 => Some(VentState::Opening),
            2 => Some(VentState::Open),
            3 => Some(VentState::Closing),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VentState::Closed => "closed",
            VentState::Opening => "opening",
            VentState::Open => "open",
            VentState::Closing => "closing",
        }
    }
}
