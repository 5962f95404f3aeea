//! System-backed `LuksProvider` implementation.
//!
//! Wraps `cryptsetup` for header work and `lsblk` for device discovery.

use crate::command::CryptsetupCommand;
use crate::parse::{parse_lsblk, parse_v1_slots, parse_v2_metadata, parse_version, token_json};
use autounlock_core::config::{resolve_binary, KNOWN_CRYPTSETUP_PATHS, KNOWN_LSBLK_PATHS};
use autounlock_core::error::{AutoUnlockError, AutoUnlockResult};
use autounlock_core::process::ExternalCommand;
use autounlock_core::AutoUnlockConfig;
use autounlock_provider::luks::{
    EncryptedDevice, HeaderFormat, HeaderMetadata, KeyMaterial, LuksProvider, SlotAnnotation,
    ORIGINAL_SLOT,
};
use log::{debug, warn};
use std::path::{Path, PathBuf};

const LSBLK_ARGS: &[&str] = &["-J", "-p", "-o", "NAME,FSTYPE,TYPE,MOUNTPOINT"];

/// System provider that manages LUKS headers via the host `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct SystemLuksProvider {
    cryptsetup: CryptsetupCommand,
    lsblk: ExternalCommand,
}

impl SystemLuksProvider {
    /// Build a provider from configuration, resolving `cryptsetup` and `lsblk`.
    pub fn from_config(config: &AutoUnlockConfig) -> AutoUnlockResult<Self> {
        let cryptsetup = resolve_binary(
            config.paths.cryptsetup_path.as_deref(),
            KNOWN_CRYPTSETUP_PATHS,
            "cryptsetup",
        )?;
        let lsblk = resolve_binary(
            config.paths.lsblk_path.as_deref(),
            KNOWN_LSBLK_PATHS,
            "lsblk",
        )?;
        Ok(Self::new(cryptsetup, lsblk))
    }

    pub fn new(cryptsetup: impl Into<PathBuf>, lsblk: impl Into<PathBuf>) -> Self {
        Self {
            cryptsetup: CryptsetupCommand::new(cryptsetup.into()),
            lsblk: ExternalCommand::new(lsblk),
        }
    }
}

impl LuksProvider for SystemLuksProvider {
    type Error = AutoUnlockError;

    fn list_encrypted_devices(&self) -> AutoUnlockResult<Vec<EncryptedDevice>> {
        let out = self.lsblk.run(LSBLK_ARGS, None)?;
        if !out.success() {
            return Err(AutoUnlockError::Provider(format!(
                "lsblk failed (exit code {}): {}",
                out.status,
                out.diagnostic()
            )));
        }

        let mut devices = Vec::new();
        for device in parse_lsblk(&out.stdout)? {
            match self.cryptsetup.is_luks(&device.path) {
                Ok(true) => devices.push(device),
                Ok(false) => debug!("{} reported crypto_LUKS but isLuks disagrees", device.path),
                Err(err) => warn!("isLuks {} failed: {err}", device.path),
            }
        }
        Ok(devices)
    }

    fn read_header(&self, device: &str) -> AutoUnlockResult<HeaderMetadata> {
        let dump = self.cryptsetup.dump(device)?;
        let format = parse_version(&dump)?;
        let (occupied_slots, annotations) = match format {
            HeaderFormat::V1 => (parse_v1_slots(&dump), Vec::new()),
            HeaderFormat::V2 => parse_v2_metadata(&self.cryptsetup.dump_json(device)?)?,
        };
        Ok(HeaderMetadata {
            format,
            occupied_slots,
            annotations,
        })
    }

    fn header_uuid(&self, device: &str) -> AutoUnlockResult<String> {
        self.cryptsetup.uuid(device)
    }

    fn test_unlock(
        &self,
        device: &str,
        key: KeyMaterial<'_>,
        slot: Option<u8>,
    ) -> AutoUnlockResult<bool> {
        self.cryptsetup.test_key(device, key, slot)
    }

    fn add_key(
        &self,
        device: &str,
        existing: KeyMaterial<'_>,
        new_key: &[u8],
        slot: Option<u8>,
    ) -> AutoUnlockResult<()> {
        if slot == Some(ORIGINAL_SLOT) {
            return Err(AutoUnlockError::SafetyAbort {
                device: device.to_string(),
                reason: "slot 0 is reserved for the original credential".into(),
            });
        }
        self.cryptsetup.add_key(device, existing, new_key, slot)
    }

    fn remove_slot(
        &self,
        device: &str,
        slot: u8,
        authorizing: KeyMaterial<'_>,
    ) -> AutoUnlockResult<()> {
        if slot == ORIGINAL_SLOT {
            return Err(AutoUnlockError::SafetyAbort {
                device: device.to_string(),
                reason: "slot 0 is never removed".into(),
            });
        }
        self.cryptsetup.kill_slot(device, slot, authorizing)
    }

    fn backup_header(&self, device: &str, destination: &Path) -> AutoUnlockResult<()> {
        self.cryptsetup.header_backup(device, destination)
    }

    fn restore_header(&self, device: &str, source: &Path) -> AutoUnlockResult<()> {
        self.cryptsetup.header_restore(device, source)
    }

    fn import_annotation(&self, device: &str, annotation: &SlotAnnotation) -> AutoUnlockResult<()> {
        self.cryptsetup.token_import(device, &token_json(annotation)?)
    }

    fn remove_annotation(&self, device: &str, token_id: u32) -> AutoUnlockResult<()> {
        self.cryptsetup.token_remove(device, token_id)
    }
}
