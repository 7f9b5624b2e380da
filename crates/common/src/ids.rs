//! Unit identity and downlink addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of units a single hub coordinates.
pub const MAX_UNITS: usize = 6;

/// Identity of one greenhouse unit, always in `1..=MAX_UNITS`.
///
/// The wire reserves `0` for "every unit", which is modelled by
/// [`Address::Broadcast`] instead of a magic id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct UnitId(u8);

impl UnitId {
    pub fn new(raw: u8) -> Option<Self> {
        if (1..=MAX_UNITS as u8).contains(&raw) {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based slot index, used for fixed-capacity tables and persisted
    /// settings slots.
    pub fn index(self) -> usize {
        self.0 as usize - 1
    }

    pub fn from_index(index: usize) -> Option<Self> {
        u8::try_from(index + 1).ok().and_then(Self::new)
    }

    /// Every possible unit id, in order.
    pub fn all() -> impl Iterator<Item = UnitId> {
        (1..=MAX_UNITS as u8).map(UnitId)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for UnitId {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        UnitId::new(raw).ok_or_else(|| format!("unit id {raw} out of range 1..={MAX_UNITS}"))
    }
}

impl From<UnitId> for u8 {
    fn from(id: UnitId) -> u8 {
        id.0
    }
}

/// Logical destination of a downlink frame. The radio (or broker topic)
/// always broadcasts; receivers filter with [`Address::accepts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Broadcast,
    Unicast(UnitId),
}

impl Address {
    /// Decode the wire's target byte (`0` = broadcast).
    pub fn from_wire(raw: u8) -> Option<Self> {
        if raw == 0 {
            Some(Address::Broadcast)
        } else {
            UnitId::new(raw).map(Address::Unicast)
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Address::Broadcast => 0,
            Address::Unicast(id) => id.get(),
        }
    }

    pub fn accepts(self, unit: UnitId) -> bool {
        match self {
            Address::Broadcast => true,
            Address::Unicast(id) => id == unit,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Broadcast => write!(f, "broadcast"),
            Address::Unicast(id) => write!(f, "unit {id}"),
        }
    }
}
