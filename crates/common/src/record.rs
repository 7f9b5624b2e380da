//! Versioned on-disk record for one unit's settings.
//!
//! ```text
//! [0]      schema version (1)
//! [1]      flags: bit0 auto mode, bit1 schedule enabled
//! [2..6]   threshold   f32 LE
//! [6..10]  hysteresis  f32 LE
//! [10]     pending manual command ('O' | 'C' | 'S' | 0)
//! [11..15] schedule open hh, open mm, close hh, close mm
//! [15]     additive checksum of bytes 0..15
//! ```
//!
//! Decoding never fails: a record that cannot be trusted as a whole falls
//! back to defaults, and a single out-of-bounds field falls back to that
//! field's default.

use crate::settings::{
    ClockTime, ControlSettings, ManualCommand, Mode, Schedule, HYSTERESIS_RANGE, THRESHOLD_RANGE,
};

pub const RECORD_LEN: usize = 16;
pub const SCHEMA_VERSION: u8 = 1;

const FLAG_AUTO: u8 = 0b01;
const FLAG_SCHEDULE: u8 = 0b10;

/// Result of decoding a stored record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decoded {
    pub settings: ControlSettings,
    /// Something was substituted; the slot should be rewritten.
    pub repaired: bool,
}

pub fn encode(s: &ControlSettings) -> [u8; RECORD_LEN] {
    let mut b = [0u8; RECORD_LEN];
    b[0] = SCHEMA_VERSION;
    let mut flags = 0;
    if s.mode == Mode::Auto {
        flags |= FLAG_AUTO;
    }
    if s.schedule.enabled {
        flags |= FLAG_SCHEDULE;
    }
    b[1] = flags;
    b[2..6].copy_from_slice(&s.threshold_c.to_le_bytes());
    b[6..10].copy_from_slice(&s.hysteresis_c.to_le_bytes());
    b[10] = s.pending_manual.map_or(0, ManualCommand::to_byte);
    b[11] = s.schedule.open.hour;
    b[12] = s.schedule.open.minute;
    b[13] = s.schedule.close.hour;
    b[14] = s.schedule.close.minute;
    b[15] = checksum(&b[..RECORD_LEN - 1]);
    b
}

/// Decode a slot; `None` means the slot was never written.
pub fn decode(raw: Option<&[u8; RECORD_LEN]>) -> Decoded {
    let Some(b) = raw else {
        return Decoded {
            settings: ControlSettings::default(),
            repaired: true,
        };
    };

    if b[0] != SCHEMA_VERSION || b[15] != checksum(&b[..RECORD_LEN - 1]) {
        tracing::warn!(
            version = b[0],
            "settings record unreadable, falling back to defaults"
        );
        return Decoded {
            settings: ControlSettings::default(),
            repaired: true,
        };
    }

    let defaults = ControlSettings::default();
    let mut repaired = false;

    let threshold_c = f32::from_le_bytes([b[2], b[3], b[4], b[5]]);
    let threshold_c = if THRESHOLD_RANGE.contains(&threshold_c) {
        threshold_c
    } else {
        tracing::warn!(value = threshold_c, "stored threshold out of bounds, using default");
        repaired = true;
        defaults.threshold_c
    };

    let hysteresis_c = f32::from_le_bytes([b[6], b[7], b[8], b[9]]);
    let hysteresis_c = if HYSTERESIS_RANGE.contains(&hysteresis_c) {
        hysteresis_c
    } else {
        tracing::warn!(value = hysteresis_c, "stored hysteresis out of bounds, using default");
        repaired = true;
        defaults.hysteresis_c
    };

    let pending_manual = ManualCommand::from_byte(b[10]).unwrap_or_else(|_| {
        repaired = true;
        None
    });

    let open = ClockTime::new(b[11], b[12]).unwrap_or_else(|| {
        repaired = true;
        defaults.schedule.open
    });
    let close = ClockTime::new(b[13], b[14]).unwrap_or_else(|| {
        repaired = true;
        defaults.schedule.close
    });

    let flags = b[1];
    if flags & !(FLAG_AUTO | FLAG_SCHEDULE) != 0 {
        repaired = true;
    }

    Decoded {
        settings: ControlSettings {
            threshold_c,
            hysteresis_c,
            mode: if flags & FLAG_AUTO != 0 {
                Mode::Auto
            } else {
                Mode::Manual
            },
            pending_manual,
            schedule: Schedule {
                open,
                close,
                enabled: flags & FLAG_SCHEDULE != 0,
            },
        },
        repaired,
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom() -> ControlSettings {
        ControlSettings {
            threshold_c: 31.5,
            hysteresis_c: 1.25,
            mode: Mode::Manual,
            pending_manual: Some(ManualCommand::Close),
            schedule: Schedule {
                open: ClockTime::new(6, 45).unwrap(),
                close: ClockTime::new(20, 0).unwrap(),
                enabled: true,
            },
        }
    }

    /// Re-stamp the checksum after poking at a record.
    fn reseal(b: &mut [u8; RECORD_LEN]) {
        b[15] = checksum(&b[..RECORD_LEN - 1]);
    }

    #[test]
    fn record_starts_with_schema_version() {
        assert_eq!(encode(&ControlSettings::default())[0], SCHEMA_VERSION);
    }

    #[test]
    fn stored_settings_load_back_unchanged() {
        let rec = encode(&custom());
        let d = decode(Some(&rec));
        assert_eq!(d.settings, custom());
        assert!(!d.repaired);
    }

    #[test]
    fn empty_slot_loads_defaults_and_asks_for_rewrite() {
        let d = decode(None);
        assert_eq!(d.settings, ControlSettings::default());
        assert!(d.repaired);
    }

    #[test]
    fn erased_flash_loads_defaults() {
        let d = decode(Some(&[0xFF; RECORD_LEN]));
        assert_eq!(d.settings, ControlSettings::default());
        assert!(d.repaired);
    }

    #[test]
    fn unknown_version_loads_defaults() {
        let mut rec = encode(&custom());
        rec[0] = 9;
        reseal(&mut rec);
        let d = decode(Some(&rec));
        assert_eq!(d.settings, ControlSettings::default());
        assert!(d.repaired);
    }

    #[test]
    fn bad_checksum_loads_defaults() {
        let mut rec = encode(&custom());
        rec[3] ^= 0x40;
        let d = decode(Some(&rec));
        assert_eq!(d.settings, ControlSettings::default());
    }

    #[test]
    fn nan_threshold_replaced_by_default_only() {
        let mut rec = encode(&custom());
        rec[2..6].copy_from_slice(&f32::NAN.to_le_bytes());
        reseal(&mut rec);
        let d = decode(Some(&rec));
        assert_eq!(d.settings.threshold_c, 25.0);
        assert_eq!(d.settings.hysteresis_c, 1.25);
        assert_eq!(d.settings.mode, Mode::Manual);
        assert!(d.repaired);
    }

    #[test]
    fn out_of_range_hysteresis_replaced() {
        let mut rec = encode(&custom());
        rec[6..10].copy_from_slice(&7.5f32.to_le_bytes());
        reseal(&mut rec);
        let d = decode(Some(&rec));
        assert_eq!(d.settings.hysteresis_c, 0.5);
        assert!(d.settings.is_within_bounds());
    }

    #[test]
    fn invalid_schedule_time_replaced() {
        let mut rec = encode(&custom());
        rec[11] = 30;
        reseal(&mut rec);
        let d = decode(Some(&rec));
        assert_eq!(d.settings.schedule.open, ClockTime::new(8, 0).unwrap());
        assert_eq!(d.settings.schedule.close, ClockTime::new(20, 0).unwrap());
        assert!(d.repaired);
    }

    #[test]
    fn garbage_manual_byte_dropped() {
        let mut rec = encode(&custom());
        rec[10] = b'?';
        reseal(&mut rec);
        let d = decode(Some(&rec));
        assert_eq!(d.settings.pending_manual, None);
        assert!(d.repaired);
    }
}
