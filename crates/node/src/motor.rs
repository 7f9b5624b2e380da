//! Vent motor outputs: one relay drives the motor toward open, the other
//! toward closed. The `gpio` feature gates the real rppal driver; without it
//! a mock keeps the output levels in memory.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    Open,
    Close,
}

/// The two mutually exclusive actuator outputs of one unit.
///
/// Callers must `release` before `drive`; implementations refuse to assert a
/// direction while the opposite output is still active.
pub trait Motor {
    /// De-energise both outputs.
    fn release(&mut self);
    /// Energise exactly one output.
    fn drive(&mut self, dir: Drive);
    /// Current `(open, close)` output levels, `true` = energised.
    fn outputs(&self) -> (bool, bool);
}

// ---------------------------------------------------------------------------
// Real relay outputs (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct VentMotor {
    open_pin: OutputPin,
    close_pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    open_on: bool,
    close_on: bool,
}

#[cfg(feature = "gpio")]
impl VentMotor {
    pub fn new(open_gpio: u8, close_gpio: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let open_pin = gpio.get(open_gpio)?.into_output();
        let close_pin = gpio.get(close_gpio)?.into_output();

        let mut motor = Self {
            open_pin,
            close_pin,
            active_low,
            open_on: false,
            close_on: false,
        };
        // Fail-safe: both relays off at startup
        motor.release();
        Ok(motor)
    }

    fn level(pin: &mut OutputPin, on: bool, active_low: bool) {
        if on != active_low {
            pin.set_high()
        } else {
            pin.set_low()
        }
    }
}

#[cfg(feature = "gpio")]
impl Motor for VentMotor {
    fn release(&mut self) {
        Self::level(&mut self.open_pin, false, self.active_low);
        Self::level(&mut self.close_pin, false, self.active_low);
        self.open_on = false;
        self.close_on = false;
    }

    fn drive(&mut self, dir: Drive) {
        match dir {
            Drive::Open if !self.close_on => {
                Self::level(&mut self.open_pin, true, self.active_low);
                self.open_on = true;
            }
            Drive::Close if !self.open_on => {
                Self::level(&mut self.close_pin, true, self.active_low);
                self.close_on = true;
            }
            _ => tracing::error!(?dir, "refusing to drive motor: opposite output active"),
        }
    }

    fn outputs(&self) -> (bool, bool) {
        (self.open_on, self.close_on)
    }
}

// ---------------------------------------------------------------------------
// Mock outputs (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
#[derive(Debug, Default)]
pub struct VentMotor {
    pub(crate) open_on: bool,
    pub(crate) close_on: bool,
    /// Times `drive` was called while the opposite output was active.
    pub(crate) refused: u32,
}

#[cfg(not(feature = "gpio"))]
impl VentMotor {
    pub fn new(open_gpio: u8, close_gpio: u8, _active_low: bool) -> Result<Self> {
        tracing::info!(open_gpio, close_gpio, "[mock-gpio] vent motor initialised (no hardware)");
        Ok(Self::default())
    }
}

#[cfg(not(feature = "gpio"))]
impl Motor for VentMotor {
    fn release(&mut self) {
        self.open_on = false;
        self.close_on = false;
    }

    fn drive(&mut self, dir: Drive) {
        match dir {
            Drive::Open if !self.close_on => self.open_on = true,
            Drive::Close if !self.open_on => self.close_on = true,
            _ => {
                self.refused += 1;
                tracing::error!(?dir, "[mock-gpio] refusing to drive: opposite output active");
            }
        }
    }

    fn outputs(&self) -> (bool, bool) {
        (self.open_on, self.close_on)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    #[test]
    fn starts_released() {
        let m = VentMotor::new(17, 27, true).unwrap();
        assert_eq!(m.outputs(), (false, false));
    }

    #[test]
    fn drive_open_then_release() {
        let mut m = VentMotor::new(17, 27, true).unwrap();
        m.drive(Drive::Open);
        assert_eq!(m.outputs(), (true, false));
        m.release();
        assert_eq!(m.outputs(), (false, false));
    }

    #[test]
    fn refuses_opposite_direction_without_release() {
        let mut m = VentMotor::new(17, 27, true).unwrap();
        m.drive(Drive::Close);
        m.drive(Drive::Open);
        assert_eq!(m.outputs(), (false, true));
        assert_eq!(m.refused, 1);
    }

    #[test]
    fn release_then_reverse_is_allowed() {
        let mut m = VentMotor::new(17, 27, true).unwrap();
        m.drive(Drive::Close);
        m.release();
        m.drive(Drive::Open);
        assert_eq!(m.outputs(), (true, false));
        assert_eq!(m.refused, 0);
    }
}
