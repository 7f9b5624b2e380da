use greenhouse_common::link::{Direction, UPLINK_TOPIC};
use greenhouse_common::{Frame, TelemetryMessage, WireError};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::registry::SharedRegistry;

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) enum Uplink {
    Telemetry(TelemetryMessage),
    /// Someone else's traffic on a topic we happen to see.
    Ignored,
    Malformed(WireError),
}

/// Sort one received publish. Only telemetry frames on the uplink topic are
/// of interest; downlink echoes and stray frame kinds are ignored.
pub(crate) fn classify(topic: &str, payload: &[u8]) -> Uplink {
    if Direction::from_topic(topic) != Some(Direction::Uplink) {
        return Uplink::Ignored;
    }
    match Frame::decode(payload) {
        Ok(Frame::Telemetry(msg)) => Uplink::Telemetry(msg),
        Ok(_) => Uplink::Ignored,
        Err(e) => Uplink::Malformed(e),
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Poll the broker connection forever, forwarding telemetry to the driver
/// loop. Returns only when the driver loop has gone away.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    registry: SharedRegistry,
    telemetry: mpsc::Sender<TelemetryMessage>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => match classify(&p.topic, &p.payload) {
                Uplink::Telemetry(msg) => {
                    debug!(
                        unit = %msg.unit,
                        temperature = msg.reading.temperature_c,
                        vent = msg.vent.as_str(),
                        "telemetry"
                    );
                    if telemetry.send(msg).await.is_err() {
                        error!("driver loop gone, stopping uplink");
                        return;
                    }
                }
                Uplink::Ignored => {}
                Uplink::Malformed(e) => {
                    warn!(topic = %p.topic, "bad uplink frame: {e}");
                    registry
                        .write()
                        .await
                        .record_error(format!("bad uplink frame: {e}"));
                }
            },
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(e) = client.try_subscribe(UPLINK_TOPIC, QoS::AtMostOnce) {
                    error!("subscribe failed: {e}");
                }
                let mut reg = registry.write().await;
                reg.mqtt_connected = true;
                reg.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut reg = registry.write().await;
                reg.mqtt_connected = false;
                reg.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut reg = registry.write().await;
                    if reg.mqtt_connected {
                        reg.record_error(format!("mqtt error: {e}"));
                    }
                    reg.mqtt_connected = false;
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use greenhouse_common::link::DOWNLINK_TOPIC;
    use greenhouse_common::{
        Address, ControlMessage, ControlSettings, SensorReading, UnitId, VentState,
    };

    fn telemetry() -> TelemetryMessage {
        TelemetryMessage {
            unit: UnitId::new(3).unwrap(),
            reading: SensorReading {
                temperature_c: 27.25,
                humidity_pct: 61.0,
                pressure_hpa: 1009.5,
                timestamp_ms: 123_456,
            },
            vent: VentState::Opening,
        }
    }

    #[test]
    fn telemetry_on_uplink_is_accepted() {
        let bytes = Frame::Telemetry(telemetry()).encode();
        assert_eq!(classify(UPLINK_TOPIC, &bytes), Uplink::Telemetry(telemetry()));
    }

    #[test]
    fn downlink_echo_is_ignored() {
        let bytes = Frame::Telemetry(telemetry()).encode();
        assert_eq!(classify(DOWNLINK_TOPIC, &bytes), Uplink::Ignored);
    }

    #[test]
    fn unrelated_topic_is_ignored_even_if_garbage() {
        assert_eq!(classify("tele/node-a/reading", b"{}"), Uplink::Ignored);
    }

    #[test]
    fn control_frame_on_uplink_is_ignored() {
        let frame = Frame::Control(ControlMessage::for_settings(
            Address::Broadcast,
            &ControlSettings::default(),
        ));
        assert_eq!(classify(UPLINK_TOPIC, &frame.encode()), Uplink::Ignored);
    }

    #[test]
    fn wrong_length_is_malformed() {
        assert!(matches!(
            classify(UPLINK_TOPIC, &[0u8; 5]),
            Uplink::Malformed(_)
        ));
        assert!(matches!(classify(UPLINK_TOPIC, &[]), Uplink::Malformed(_)));
    }

    #[test]
    fn bad_vent_byte_is_malformed() {
        let mut bytes = Frame::Telemetry(telemetry()).encode();
        bytes[13] = 9;
        assert!(matches!(
            classify(UPLINK_TOPIC, &bytes),
            Uplink::Malformed(_)
        ));
    }
}
