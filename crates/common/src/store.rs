//! Durable settings, one fixed-size record per slot.
//!
//! The hub keeps one slot per unit (`UnitId::index()`), a unit keeps a single
//! slot for itself. Loading never fails: anything unreadable is replaced by
//! defaults and written back.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::record::{self, RECORD_LEN};
use crate::settings::ControlSettings;

/// Raw slot storage (flash page, file, memory).
pub trait SlotBackend: Send + Sync {
    /// `Ok(None)` when the slot has never been written.
    fn read(&self, slot: usize) -> io::Result<Option<[u8; RECORD_LEN]>>;
    fn write(&mut self, slot: usize, record: &[u8; RECORD_LEN]) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

/// All slots packed back to back in one file. Writes go to a sibling temp
/// file which is then renamed over the original, so a power cut leaves
/// either the old or the new contents.
pub struct FileBackend {
    path: PathBuf,
    slots: usize,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>, slots: usize) -> Self {
        Self {
            path: path.into(),
            slots,
        }
    }

    fn read_all(&self) -> io::Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

impl SlotBackend for FileBackend {
    fn read(&self, slot: usize) -> io::Result<Option<[u8; RECORD_LEN]>> {
        let bytes = self.read_all()?;
        let start = slot * RECORD_LEN;
        let Some(chunk) = bytes.get(start..start + RECORD_LEN) else {
            return Ok(None);
        };
        let mut rec = [0u8; RECORD_LEN];
        rec.copy_from_slice(chunk);
        Ok(Some(rec))
    }

    fn write(&mut self, slot: usize, rec: &[u8; RECORD_LEN]) -> io::Result<()> {
        let mut bytes = self.read_all()?;
        // Unwritten slots are zero-filled, which decodes as "unreadable" and
        // therefore as defaults.
        bytes.resize(self.slots.max(slot + 1) * RECORD_LEN, 0);
        let start = slot * RECORD_LEN;
        bytes[start..start + RECORD_LEN].copy_from_slice(rec);

        let tmp = self.path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}

// ---------------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------------

/// Volatile backend. Clones share the same slots, so a test can keep a
/// handle and inspect what the store wrote.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    slots: Arc<Mutex<Vec<Option<[u8; RECORD_LEN]>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place raw bytes in a slot, bypassing the codec.
    pub fn poke(&self, slot: usize, rec: [u8; RECORD_LEN]) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.len() <= slot {
            slots.resize(slot + 1, None);
        }
        slots[slot] = Some(rec);
    }

    pub fn peek(&self, slot: usize) -> Option<[u8; RECORD_LEN]> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(slot).copied().flatten()
    }
}

impl SlotBackend for MemoryBackend {
    fn read(&self, slot: usize) -> io::Result<Option<[u8; RECORD_LEN]>> {
        Ok(self.peek(slot))
    }

    fn write(&mut self, slot: usize, rec: &[u8; RECORD_LEN]) -> io::Result<()> {
        self.poke(slot, *rec);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SettingsStore {
    backend: Box<dyn SlotBackend>,
    capacity: usize,
}

impl SettingsStore {
    pub fn new(backend: impl SlotBackend + 'static, capacity: usize) -> Self {
        Self {
            backend: Box::new(backend),
            capacity,
        }
    }

    /// Load one slot, substituting defaults for anything out of bounds and
    /// rewriting the slot when a substitution happened.
    pub fn load(&mut self, slot: usize) -> ControlSettings {
        if slot >= self.capacity {
            tracing::warn!(slot, capacity = self.capacity, "load from slot out of range");
            return ControlSettings::default();
        }

        let raw = match self.backend.read(slot) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(slot, "settings read failed, using defaults: {e}");
                None
            }
        };

        let decoded = record::decode(raw.as_ref());
        if decoded.repaired {
            if let Err(e) = self.save(slot, &decoded.settings) {
                tracing::warn!(slot, "rewriting repaired settings failed: {e}");
            }
        }
        decoded.settings
    }

    pub fn save(&mut self, slot: usize, settings: &ControlSettings) -> Result<(), StoreError> {
        if slot >= self.capacity {
            return Err(StoreError::Slot {
                slot,
                capacity: self.capacity,
            });
        }
        self.backend.write(slot, &record::encode(settings))?;
        Ok(())
    }
}
