//! Fixed-size little-endian frames exchanged over the broadcast link.
//!
//! Frames carry no type tag; like the radio firmware they are told apart by
//! length alone:
//!
//! ```text
//! telemetry  18 B  nodeId:u8 temp:f32 hum:f32 press:f32 vent:u8 ts:u32
//! control    11 B  target:u8 threshold:f32 hysteresis:f32 auto:u8 manual:u8
//! schedule    6 B  target:u8 openH:u8 openM:u8 closeH:u8 closeM:u8 enabled:u8
//! ```

use crate::error::WireError;
use crate::ids::{Address, UnitId};
use crate::reading::{SensorReading, VentState};
use crate::settings::{ClockTime, ControlSettings, ManualCommand, Mode, Schedule, SettingsPatch};

pub const TELEMETRY_LEN: usize = 18;
pub const CONTROL_LEN: usize = 11;
pub const SCHEDULE_LEN: usize = 6;

/// Unit -> hub status report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryMessage {
    pub unit: UnitId,
    /// Raw values as sent; may be NaN when the unit's sensor is faulty.
    pub reading: SensorReading,
    pub vent: VentState,
}

/// Hub -> unit settings/command frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlMessage {
    pub target: Address,
    pub threshold_c: f32,
    pub hysteresis_c: f32,
    pub mode: Mode,
    pub manual: Option<ManualCommand>,
}

/// Hub -> unit schedule companion frame (the control frame has no room for
/// schedule fields).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleMessage {
    pub target: Address,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    Telemetry(TelemetryMessage),
    Control(ControlMessage),
    Schedule(ScheduleMessage),
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

impl ControlMessage {
    pub fn for_settings(target: Address, s: &ControlSettings) -> Self {
        Self {
            target,
            threshold_c: s.threshold_c,
            hysteresis_c: s.hysteresis_c,
            mode: s.mode,
            manual: s.pending_manual,
        }
    }

    /// The settings change this frame asks the receiving unit to make.
    pub fn to_patch(&self) -> SettingsPatch {
        SettingsPatch {
            threshold_c: Some(self.threshold_c),
            hysteresis_c: Some(self.hysteresis_c),
            mode: Some(self.mode),
            manual: self.manual,
            schedule: None,
        }
    }
}

impl ScheduleMessage {
    pub fn to_patch(&self) -> SettingsPatch {
        SettingsPatch {
            schedule: Some(self.schedule),
            ..Default::default()
        }
    }
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Telemetry(t) => encode_telemetry(t).to_vec(),
            Frame::Control(c) => encode_control(c).to_vec(),
            Frame::Schedule(s) => encode_schedule(s).to_vec(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Frame, WireError> {
        match buf.len() {
            TELEMETRY_LEN => decode_telemetry(buf).map(Frame::Telemetry),
            CONTROL_LEN => decode_control(buf).map(Frame::Control),
            SCHEDULE_LEN => decode_schedule(buf).map(Frame::Schedule),
            n => Err(WireError::Length(n)),
        }
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

fn encode_telemetry(t: &TelemetryMessage) -> [u8; TELEMETRY_LEN] {
    let mut b = [0u8; TELEMETRY_LEN];
    b[0] = t.unit.get();
    b[1..5].copy_from_slice(&t.reading.temperature_c.to_le_bytes());
    b[5..9].copy_from_slice(&t.reading.humidity_pct.to_le_bytes());
    b[9..13].copy_from_slice(&t.reading.pressure_hpa.to_le_bytes());
    b[13] = t.vent.to_wire();
    b[14..18].copy_from_slice(&t.reading.timestamp_ms.to_le_bytes());
    b
}

fn decode_telemetry(b: &[u8]) -> Result<TelemetryMessage, WireError> {
    let unit = UnitId::new(b[0]).ok_or(WireError::Field {
        field: "nodeId",
        value: b[0],
    })?;
    let vent = VentState::from_wire(b[13]).ok_or(WireError::Field {
        field: "ventStatus",
        value: b[13],
    })?;
    Ok(TelemetryMessage {
        unit,
        reading: SensorReading {
            temperature_c: f32_at(b, 1),
            humidity_pct: f32_at(b, 5),
            pressure_hpa: f32_at(b, 9),
            timestamp_ms: u32::from_le_bytes([b[14], b[15], b[16], b[17]]),
        },
        vent,
    })
}

fn encode_control(c: &ControlMessage) -> [u8; CONTROL_LEN] {
    let mut b = [0u8; CONTROL_LEN];
    b[0] = c.target.to_wire();
    b[1..5].copy_from_slice(&c.threshold_c.to_le_bytes());
    b[5..9].copy_from_slice(&c.hysteresis_c.to_le_bytes());
    b[9] = u8::from(c.mode == Mode::Auto);
    b[10] = c.manual.map_or(0, ManualCommand::to_byte);
    b
}

fn decode_control(b: &[u8]) -> Result<ControlMessage, WireError> {
    let target = target_at(b)?;
    let mode = match b[9] {
        0 => Mode::Manual,
        1 => Mode::Auto,
        value => {
            return Err(WireError::Field {
                field: "autoMode",
                value,
            })
        }
    };
    let manual = ManualCommand::from_byte(b[10]).map_err(|value| WireError::Field {
        field: "manualCommand",
        value,
    })?;
    Ok(ControlMessage {
        target,
        threshold_c: f32_at(b, 1),
        hysteresis_c: f32_at(b, 5),
        mode,
        manual,
    })
}

fn encode_schedule(s: &ScheduleMessage) -> [u8; SCHEDULE_LEN] {
    [
        s.target.to_wire(),
        s.schedule.open.hour,
        s.schedule.open.minute,
        s.schedule.close.hour,
        s.schedule.close.minute,
        u8::from(s.schedule.enabled),
    ]
}

fn decode_schedule(b: &[u8]) -> Result<ScheduleMessage, WireError> {
    let target = target_at(b)?;
    let open = ClockTime::new(b[1], b[2]).ok_or(WireError::Field {
        field: "openTime",
        value: b[1],
    })?;
    let close = ClockTime::new(b[3], b[4]).ok_or(WireError::Field {
        field: "closeTime",
        value: b[3],
    })?;
    let enabled = match b[5] {
        0 => false,
        1 => true,
        value => {
            return Err(WireError::Field {
                field: "enabled",
                value,
            })
        }
    };
    Ok(ScheduleMessage {
        target,
        schedule: Schedule {
            open,
            close,
            enabled,
        },
    })
}

fn target_at(b: &[u8]) -> Result<Address, WireError> {
    Address::from_wire(b[0]).ok_or(WireError::Field {
        field: "targetNodeId",
        value: b[0],
    })
}

fn f32_at(b: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(n: u8) -> UnitId {
        UnitId::new(n).unwrap()
    }

    #[test]
    fn telemetry_layout_is_packed_little_endian() {
        let msg = TelemetryMessage {
            unit: unit(3),
            reading: SensorReading {
                temperature_c: 1.0,
                humidity_pct: 0.0,
                pressure_hpa: 0.0,
                timestamp_ms: 0x0102_0304,
            },
            vent: VentState::Open,
        };
        let bytes = Frame::Telemetry(msg).encode();
        assert_eq!(bytes.len(), TELEMETRY_LEN);
        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..5], &1.0f32.to_le_bytes());
        assert_eq!(bytes[13], 2);
        assert_eq!(&bytes[14..18], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn telemetry_decodes_what_a_unit_sends() {
        let msg = TelemetryMessage {
            unit: unit(6),
            reading: SensorReading {
                temperature_c: 26.25,
                humidity_pct: 71.5,
                pressure_hpa: 1009.75,
                timestamp_ms: 123_456,
            },
            vent: VentState::Closing,
        };
        let decoded = Frame::decode(&Frame::Telemetry(msg).encode()).unwrap();
        assert_eq!(decoded, Frame::Telemetry(msg));
    }

    #[test]
    fn telemetry_keeps_nan_values() {
        let msg = TelemetryMessage {
            unit: unit(1),
            reading: SensorReading {
                temperature_c: f32::NAN,
                humidity_pct: 50.0,
                pressure_hpa: 1000.0,
                timestamp_ms: 1,
            },
            vent: VentState::Closed,
        };
        let Frame::Telemetry(back) = Frame::decode(&Frame::Telemetry(msg).encode()).unwrap()
        else {
            panic!("expected telemetry");
        };
        assert!(back.reading.temperature_c.is_nan());
    }

    #[test]
    fn telemetry_from_unit_zero_is_rejected() {
        let mut bytes = [0u8; TELEMETRY_LEN];
        bytes[0] = 0;
        assert_eq!(
            Frame::decode(&bytes),
            Err(WireError::Field {
                field: "nodeId",
                value: 0
            })
        );
    }

    #[test]
    fn telemetry_with_bad_vent_byte_is_rejected() {
        let mut bytes = [0u8; TELEMETRY_LEN];
        bytes[0] = 1;
        bytes[13] = 7;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(WireError::Field {
                field: "ventStatus",
                ..
            })
        ));
    }

    #[test]
    fn control_layout() {
        let msg = ControlMessage {
            target: Address::Unicast(unit(2)),
            threshold_c: 27.0,
            hysteresis_c: 1.0,
            mode: Mode::Manual,
            manual: Some(ManualCommand::Open),
        };
        let bytes = Frame::Control(msg).encode();
        assert_eq!(bytes.len(), CONTROL_LEN);
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[9], 0);
        assert_eq!(bytes[10], b'O');
        assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Control(msg));
    }

    #[test]
    fn broadcast_control_uses_target_zero() {
        let msg = ControlMessage::for_settings(Address::Broadcast, &ControlSettings::default());
        let bytes = Frame::Control(msg).encode();
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[9], 1);
        assert_eq!(bytes[10], 0);
    }

    #[test]
    fn control_with_unknown_manual_byte_is_rejected() {
        let mut bytes = Frame::Control(ControlMessage::for_settings(
            Address::Broadcast,
            &ControlSettings::default(),
        ))
        .encode();
        bytes[10] = b'Z';
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn schedule_frame() {
        let msg = ScheduleMessage {
            target: Address::Unicast(unit(5)),
            schedule: Schedule {
                open: ClockTime::new(7, 30).unwrap(),
                close: ClockTime::new(19, 15).unwrap(),
                enabled: true,
            },
        };
        let bytes = Frame::Schedule(msg).encode();
        assert_eq!(bytes, vec![5, 7, 30, 19, 15, 1]);
        assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Schedule(msg));
    }

    #[test]
    fn schedule_with_invalid_time_is_rejected() {
        assert!(Frame::decode(&[1, 24, 0, 18, 0, 1]).is_err());
    }

    #[test]
    fn unknown_length_is_rejected() {
        assert_eq!(Frame::decode(&[1, 2, 3]), Err(WireError::Length(3)));
        assert_eq!(Frame::decode(&[]), Err(WireError::Length(0)));
    }

    #[test]
    fn control_patch_carries_manual_command() {
        let msg = ControlMessage {
            target: Address::Broadcast,
            threshold_c: 30.0,
            hysteresis_c: 2.0,
            mode: Mode::Manual,
            manual: Some(ManualCommand::Stop),
        };
        let patch = msg.to_patch();
        assert_eq!(patch.threshold_c, Some(30.0));
        assert_eq!(patch.manual, Some(ManualCommand::Stop));
        assert_eq!(patch.schedule, None);
    }
}
