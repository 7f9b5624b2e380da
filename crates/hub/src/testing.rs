//! Test doubles shared by the hub's module tests.

use async_trait::async_trait;
use greenhouse_common::link::Link;
use greenhouse_common::store::{MemoryBackend, SettingsStore};
use greenhouse_common::{
    ControlMessage, ControlSettings, Frame, TransportError, UnitId, MAX_UNITS,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::registry::{Registry, SharedRegistry};
use crate::router::Router;

/// Link that remembers every frame instead of sending it.
#[derive(Clone, Default)]
pub struct RecordingLink {
    frames: Arc<Mutex<Vec<Frame>>>,
    fail: bool,
}

impl RecordingLink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn controls(&self) -> Vec<ControlMessage> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Control(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

#[async_trait]
impl Link for RecordingLink {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Send("radio unplugged".into()));
        }
        self.frames.lock().unwrap().push(*frame);
        Ok(())
    }
}

pub fn id(n: u8) -> UnitId {
    UnitId::new(n).unwrap()
}

/// A router over `ids` with default settings, an in-memory store and a
/// recording link.
pub fn router(ids: &[u8]) -> (Router, SharedRegistry, RecordingLink, MemoryBackend) {
    let units = ids
        .iter()
        .map(|n| (id(*n), format!("GH{n}"), ControlSettings::default()))
        .collect();
    let registry = Registry::new(units, Duration::from_secs(300)).shared();
    let backend = MemoryBackend::new();
    let link = RecordingLink::default();
    let router = Router::new(
        Arc::clone(&registry),
        SettingsStore::new(backend.clone(), MAX_UNITS),
        Arc::new(link.clone()),
    );
    (router, registry, link, backend)
}
