//! Types and plumbing shared by the greenhouse hub and its units.

pub mod error;
pub mod ids;
pub mod link;
pub mod reading;
pub mod record;
pub mod settings;
pub mod store;
pub mod timer;
pub mod wire;

pub use error::{SensorFault, SettingsError, StoreError, TransportError, WireError};
pub use ids::{Address, UnitId, MAX_UNITS};
pub use reading::{SensorReading, VentState};
pub use settings::{ClockTime, ControlSettings, ManualCommand, Mode, Schedule, SettingsPatch};
pub use wire::{ControlMessage, Frame, ScheduleMessage, TelemetryMessage};
