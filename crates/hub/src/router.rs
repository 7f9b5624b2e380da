//! Command routing: the hub's single entry point for settings changes and
//! the only code that puts control frames on the downlink.
//!
//! Every change is validated, persisted and then sent. The registry lock is
//! released before anything goes on the air.

use greenhouse_common::link::Link;
use greenhouse_common::store::SettingsStore;
use greenhouse_common::{
    Address, ControlMessage, ControlSettings, Frame, ManualCommand, Mode, ScheduleMessage,
    SettingsError, SettingsPatch, TransportError, UnitId,
};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::registry::{ControlAllStamp, SharedRegistry, TelemetryOutcome};

/// Where a settings change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Display/menu or the local HTTP API.
    Operator,
    /// Downloaded from the remote store.
    Cloud,
    /// Decided by the hub itself (global actions).
    Hub,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Source::Operator => "operator",
            Source::Cloud => "cloud",
            Source::Hub => "hub",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("unit {0} is not configured")]
    UnknownUnit(UnitId),
    #[error(transparent)]
    Invalid(#[from] SettingsError),
}

pub struct Router {
    registry: SharedRegistry,
    store: SettingsStore,
    link: Arc<dyn Link>,
}

impl Router {
    pub fn new(registry: SharedRegistry, store: SettingsStore, link: Arc<dyn Link>) -> Self {
        Self {
            registry,
            store,
            link,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    fn persist(&mut self, unit: UnitId, settings: &ControlSettings) {
        if let Err(e) = self.store.save(unit.index(), settings) {
            warn!(unit = %unit, "persisting settings failed: {e}");
        }
    }

    /// Validate and apply `patch` to the hub's copy of `unit`, persist it and
    /// send it to the unit. A manual command is sent once and then dropped
    /// from the hub's copy. Returns whether the settings changed.
    pub async fn apply_settings(
        &mut self,
        unit: UnitId,
        patch: &SettingsPatch,
        source: Source,
    ) -> Result<bool, RouteError> {
        let (changed, outgoing, name) = {
            let mut reg = self.registry.write().await;
            let rec = reg.unit_mut(unit).ok_or(RouteError::UnknownUnit(unit))?;
            let changed = match rec.settings.apply(patch) {
                Ok(changed) => changed,
                Err(e) => {
                    let detail = format!("unit {unit}: {} settings rejected: {e}", source.as_str());
                    reg.record_error(detail);
                    return Err(e.into());
                }
            };
            let outgoing = rec.settings;
            rec.settings.pending_manual = None;
            if changed && source != Source::Cloud {
                rec.dirty = true;
            }
            (changed, outgoing, rec.name.clone())
        };

        if !changed {
            debug!(unit = %unit, source = source.as_str(), "settings unchanged");
            return Ok(false);
        }

        let stored = ControlSettings {
            pending_manual: None,
            ..outgoing
        };
        self.persist(unit, &stored);

        let detail = match outgoing.pending_manual {
            Some(cmd) => format!("unit {unit} ({name}): manual {cmd} from {}", source.as_str()),
            None => format!(
                "unit {unit} ({name}): threshold {:.1} hysteresis {:.1} {} from {}",
                outgoing.threshold_c,
                outgoing.hysteresis_c,
                outgoing.mode.as_str(),
                source.as_str()
            ),
        };
        info!(unit = %unit, source = source.as_str(), "{detail}");
        self.registry.write().await.record_command(detail);

        self.send_or_log(Address::Unicast(unit), &outgoing).await;
        Ok(true)
    }

    /// Send `settings` to `target` as a control frame plus its schedule
    /// companion. Unicast is still physically a broadcast; units filter.
    pub async fn route_command(
        &self,
        target: Address,
        settings: &ControlSettings,
    ) -> Result<(), TransportError> {
        self.link
            .send(&Frame::Control(ControlMessage::for_settings(target, settings)))
            .await?;
        self.link
            .send(&Frame::Schedule(ScheduleMessage {
                target,
                schedule: settings.schedule,
            }))
            .await
    }

    async fn send_or_log(&self, target: Address, settings: &ControlSettings) {
        if let Err(e) = self.route_command(target, settings).await {
            warn!(%target, "command not sent: {e}");
            self.registry
                .write()
                .await
                .record_error(format!("send to {target} failed: {e}"));
        }
    }

    /// Open or close every online unit: each is switched to manual mode with
    /// the action pending. Offline units are skipped, not queued. Returns
    /// the units commanded.
    pub async fn global_action(&mut self, action: ManualCommand) -> Vec<UnitId> {
        let online = {
            let mut reg = self.registry.write().await;
            reg.control_all = Some(ControlAllStamp {
                action,
                at: OffsetDateTime::now_utc(),
            });
            reg.online()
        };

        let patch = SettingsPatch {
            mode: Some(Mode::Manual),
            manual: Some(action),
            ..Default::default()
        };
        let mut commanded = Vec::new();
        for unit in online {
            match self.apply_settings(unit, &patch, Source::Hub).await {
                Ok(_) => commanded.push(unit),
                Err(e) => warn!(unit = %unit, "global {action} skipped: {e}"),
            }
        }
        info!(%action, units = commanded.len(), "global action dispatched");
        commanded
    }

    /// Give every configured unit the same full settings and announce them in
    /// one broadcast frame. Validation happens once, up front.
    pub async fn broadcast_settings(
        &mut self,
        settings: ControlSettings,
        source: Source,
    ) -> Result<(), RouteError> {
        let settings = ControlSettings {
            pending_manual: None,
            ..settings
        };
        let patch = SettingsPatch::replace_with(&settings);
        ControlSettings::default().apply(&patch)?;

        let units = {
            let mut reg = self.registry.write().await;
            let units = reg.configured();
            for unit in &units {
                if let Some(rec) = reg.unit_mut(*unit) {
                    if rec.settings != settings {
                        rec.settings = settings;
                        rec.dirty |= source != Source::Cloud;
                    }
                }
            }
            reg.record_command(format!(
                "all units: threshold {:.1} hysteresis {:.1} {} from {}",
                settings.threshold_c,
                settings.hysteresis_c,
                settings.mode.as_str(),
                source.as_str()
            ));
            units
        };
        for unit in units {
            self.persist(unit, &settings);
        }

        self.send_or_log(Address::Broadcast, &settings).await;
        Ok(())
    }

    /// Re-send every online unit its settings. Doubles as the hub heartbeat
    /// units use to decide whether to run autonomously.
    pub async fn refresh_online(&self) {
        let snapshot: Vec<(UnitId, ControlSettings)> = {
            let reg = self.registry.read().await;
            reg.online()
                .into_iter()
                .filter_map(|id| reg.unit(id).map(|u| (id, u.settings)))
                .collect()
        };
        for (unit, settings) in snapshot {
            self.send_or_log(Address::Unicast(unit), &settings).await;
        }
    }

    /// Feed telemetry to the registry; a unit coming back online gets its
    /// settings pushed straight away.
    pub async fn on_telemetry(&self, msg: &greenhouse_common::TelemetryMessage, now: Instant) {
        let (outcome, settings) = {
            let mut reg = self.registry.write().await;
            let outcome = reg.on_telemetry(msg, now);
            (outcome, reg.unit(msg.unit).map(|u| u.settings))
        };
        if let (TelemetryOutcome::Updated { came_online: true }, Some(settings)) =
            (outcome, settings)
        {
            info!(unit = %msg.unit, "unit online, pushing settings");
            self.send_or_log(Address::Unicast(msg.unit), &settings).await;
        }
    }

    pub async fn check_liveness(&self, now: Instant) -> Vec<UnitId> {
        self.registry.write().await.check_liveness(now)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
