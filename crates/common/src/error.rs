//! Error taxonomy shared by the hub and the units.
//!
//! `SensorFault` and corrupt settings are recovered where they happen;
//! `TransportError` is logged and retried on the next period. None of these
//! stop a control loop.

/// A sensor sample that cannot be trusted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorFault {
    #[error("{field} is not a number")]
    NotANumber { field: &'static str },

    #[error("{field} {value} outside physical range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("sensor bus error: {0}")]
    Bus(String),
}

/// A frame that does not decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected frame length {0}")]
    Length(usize),

    #[error("invalid {field} byte 0x{value:02x}")]
    Field { field: &'static str, value: u8 },
}

/// A settings change that violates the documented bounds. Every violation
/// found is reported, not just the first one.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("settings rejected: {}", violations.join("; "))]
pub struct SettingsError {
    pub violations: Vec<String>,
}

/// Durable settings storage failed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("settings slot {slot} out of range (capacity {capacity})")]
    Slot { slot: usize, capacity: usize },

    #[error("settings storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Broadcast/send failure on the wireless link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("link send failed: {0}")]
    Send(String),
}
