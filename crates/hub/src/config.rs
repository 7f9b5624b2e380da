//! TOML config file loading and validation for the hub, its cloud link and
//! the units it coordinates.

use anyhow::{bail, Context, Result};
use greenhouse_common::{UnitId, MAX_UNITS};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSection,
    /// Absent: the hub runs fully offline and never syncs.
    pub cloud: Option<CloudSection>,
    #[serde(default)]
    pub units: Vec<UnitEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub offline_timeout_sec: u64,
    pub liveness_sweep_sec: u64,
    pub sync_interval_sec: u64,
    pub refresh_interval_sec: u64,
    pub settings_path: String,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            offline_timeout_sec: 300,
            liveness_sweep_sec: 5,
            sync_interval_sec: 30,
            refresh_interval_sec: 60,
            settings_path: "hub-settings.bin".into(),
        }
    }
}

impl HubSection {
    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_sec)
    }

    pub fn liveness_sweep(&self) -> Duration {
        Duration::from_secs(self.liveness_sweep_sec)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_sec)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_sec)
    }
}

#[derive(Debug, Deserialize)]
pub struct CloudSection {
    /// Realtime database root, e.g. `https://example-rtdb.firebaseio.com`.
    pub database_url: String,
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

fn default_timeout_sec() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct UnitEntry {
    pub unit_id: u8,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hub(&mut errors);
        self.validate_cloud(&mut errors);
        self.validate_units(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_hub(&self, errors: &mut Vec<String>) {
        let h = &self.hub;
        for (name, value) in [
            ("offline_timeout_sec", h.offline_timeout_sec),
            ("liveness_sweep_sec", h.liveness_sweep_sec),
            ("sync_interval_sec", h.sync_interval_sec),
            ("refresh_interval_sec", h.refresh_interval_sec),
        ] {
            if value == 0 {
                errors.push(format!("hub: {name} must be positive"));
            }
        }
        if h.liveness_sweep_sec > h.offline_timeout_sec {
            errors.push(format!(
                "hub: liveness_sweep_sec ({}) exceeds offline_timeout_sec ({})",
                h.liveness_sweep_sec, h.offline_timeout_sec
            ));
        }
        // Units fall back to autonomy after five minutes of silence; the
        // refresh doubles as the heartbeat that prevents it.
        if h.refresh_interval_sec >= 300 {
            errors.push(format!(
                "hub: refresh_interval_sec ({}) must be below the unit hub timeout (300)",
                h.refresh_interval_sec
            ));
        }
        if h.settings_path.trim().is_empty() {
            errors.push("hub: settings_path is empty".into());
        }
    }

    fn validate_cloud(&self, errors: &mut Vec<String>) {
        let Some(c) = &self.cloud else {
            return;
        };
        let url = c.database_url.trim();
        if url.is_empty() {
            errors.push("cloud: database_url is empty".into());
        } else if !(url.starts_with("https://") || url.starts_with("http://")) {
            errors.push(format!(
                "cloud: database_url '{url}' must start with http:// or https://"
            ));
        }
        if c.timeout_sec == 0 {
            errors.push("cloud: timeout_sec must be positive".into());
        }
    }

    fn validate_units(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<u8> = HashSet::new();

        for (i, u) in self.units.iter().enumerate() {
            let ctx = format!("units[{i}]");

            if UnitId::new(u.unit_id).is_none() {
                errors.push(format!(
                    "{ctx}: unit_id {} out of range [1, {MAX_UNITS}]",
                    u.unit_id
                ));
            } else if !seen.insert(u.unit_id) {
                errors.push(format!("{ctx}: duplicate unit_id {}", u.unit_id));
            }

            if u.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }
        }
    }

    /// Configured units as typed ids. Only meaningful after `validate`.
    pub fn unit_list(&self) -> Vec<(UnitId, String)> {
        self.units
            .iter()
            .filter_map(|u| UnitId::new(u.unit_id).map(|id| (id, u.name.clone())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
