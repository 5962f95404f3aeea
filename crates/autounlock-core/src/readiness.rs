//! Auto-unlock readiness as a single state token.

use crate::config::ConfigStore;
use crate::error::{AutoUnlockError, AutoUnlockResult};
use crate::fingerprint::{derive_key, DerivedKey};
use crate::inspector::DeviceInspector;
use autounlock_provider::hardware::HardwareProbe;
use autounlock_provider::host::ArrayProbe;
use autounlock_provider::luks::LuksProvider;
use log::{debug, warn};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// The five readiness states, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    ArrayStopped,
    NoEncryptedDisks,
    SetupRequired,
    ReadyDisabled,
    ReadyEnabled,
}

impl ReadinessState {
    /// Wire token consumed by the web layer and boot scripts.
    pub fn as_str(self) -> &'static str {
        match self {
            ReadinessState::ArrayStopped => "array_stopped",
            ReadinessState::NoEncryptedDisks => "no_encrypted_disks",
            ReadinessState::SetupRequired => "setup_required",
            ReadinessState::ReadyDisabled => "ready_disabled",
            ReadinessState::ReadyEnabled => "ready_enabled",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The probes readiness is computed from.
pub struct Readiness<'a, S, A, L, H> {
    pub store: &'a S,
    pub array: &'a A,
    pub luks: &'a L,
    pub hardware: &'a H,
    pub probe_timeout: Duration,
}

impl<'a, S, A, L, H> Readiness<'a, S, A, L, H>
where
    S: ConfigStore,
    A: ArrayProbe<Error = AutoUnlockError>,
    L: LuksProvider<Error = AutoUnlockError>,
    H: HardwareProbe,
{
    /// Evaluate the probes in order, stopping at the first that decides.
    pub fn evaluate(&self) -> AutoUnlockResult<ReadinessState> {
        if !self.array_started() {
            return Ok(ReadinessState::ArrayStopped);
        }

        let inspector = DeviceInspector::new(self.luks);
        let devices = inspector.list_encrypted_devices()?;
        self.record_disk_hint(!devices.is_empty());
        if devices.is_empty() {
            return Ok(ReadinessState::NoEncryptedDisks);
        }

        let Some(key) = self.fresh_key() else {
            return Ok(ReadinessState::SetupRequired);
        };
        if inspector.unlockable_devices(&devices, &key).is_empty() {
            return Ok(ReadinessState::SetupRequired);
        }

        if self.store.load()?.autounlock.enabled {
            Ok(ReadinessState::ReadyEnabled)
        } else {
            Ok(ReadinessState::ReadyDisabled)
        }
    }

    /// Number of devices a freshly derived key opens.
    pub fn unlockable_count(&self) -> AutoUnlockResult<usize> {
        let inspector = DeviceInspector::new(self.luks);
        let devices = inspector.list_encrypted_devices()?;
        let Some(key) = self.fresh_key() else {
            return Ok(0);
        };
        Ok(inspector.unlockable_devices(&devices, &key).len())
    }

    /// Number of devices whose reserved slot carries a hardware-key annotation.
    pub fn keys_exist(&self) -> AutoUnlockResult<usize> {
        let inspector = DeviceInspector::new(self.luks);
        let devices = inspector.list_encrypted_devices()?;
        Ok(inspector.devices_with_hardware_key(&devices).len())
    }

    /// Whether a freshly derived key opens at least one device.
    pub fn keys_work(&self) -> AutoUnlockResult<bool> {
        Ok(self.unlockable_count()? > 0)
    }

    fn array_started(&self) -> bool {
        match self.array.array_started() {
            Ok(started) => started,
            Err(err) => {
                warn!("array state probe failed, treating array as stopped: {err}");
                false
            }
        }
    }

    fn fresh_key(&self) -> Option<DerivedKey> {
        match derive_key(self.hardware, self.probe_timeout) {
            Ok((_, key)) => Some(key),
            Err(err) => {
                debug!("hardware key unavailable for readiness: {err}");
                None
            }
        }
    }

    /// Persist the disk hint for other readers. Readiness never consults it;
    /// device enumeration always decides.
    fn record_disk_hint(&self, available: bool) {
        let recorded = self.store.load().and_then(|config| {
            if config.autounlock.encrypted_disks_available == available {
                return Ok(());
            }
            self.store
                .update(|cfg| cfg.autounlock.encrypted_disks_available = available)
                .map(|_| ())
        });
        if let Err(err) = recorded {
            warn!("could not record encrypted disk hint: {err}");
        }
    }
}
