//! The connectionless broadcast link between hub and units.
//!
//! The physical medium here is an MQTT broker standing in for the radio:
//! every downlink frame goes to one shared topic that all units listen on,
//! every uplink frame to another that only the hub listens on. Delivery is
//! QoS 0, so a frame arrives at most once and nothing is retried.
//!
//! Sends never wait on the broker. A full request queue is reported as a
//! send failure and the caller moves on.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};

use crate::error::TransportError;
use crate::wire::Frame;

/// Topic all hub -> unit frames are published on.
pub const DOWNLINK_TOPIC: &str = "greenhouse/air/down";
/// Topic all unit -> hub frames are published on.
pub const UPLINK_TOPIC: &str = "greenhouse/air/up";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    pub fn topic(self) -> &'static str {
        match self {
            Direction::Uplink => UPLINK_TOPIC,
            Direction::Downlink => DOWNLINK_TOPIC,
        }
    }

    /// Which direction a received publish belongs to, if any.
    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic {
            UPLINK_TOPIC => Some(Direction::Uplink),
            DOWNLINK_TOPIC => Some(Direction::Downlink),
            _ => None,
        }
    }
}

/// Anything that can put a frame on the air.
#[async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;
}

/// Broker-backed link. Cheap to clone; the event loop that actually moves
/// bytes is polled by the owning binary.
#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
    direction: Direction,
}

impl MqttLink {
    pub fn new(client: AsyncClient, direction: Direction) -> Self {
        Self { client, direction }
    }
}

#[async_trait]
impl Link for MqttLink {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.client
            .try_publish(self.direction.topic(), QoS::AtMostOnce, false, frame.encode())
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}
