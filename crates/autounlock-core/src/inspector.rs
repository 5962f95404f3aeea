//! Device and slot introspection over a `LuksProvider`.

use crate::error::{AutoUnlockError, AutoUnlockResult};
use crate::fingerprint::DerivedKey;
use autounlock_provider::luks::{
    EncryptedDevice, HeaderFormat, HeaderMetadata, KeyMaterial, LuksProvider, SlotAnnotation,
    ORIGINAL_SLOT, RESERVED_SLOT,
};
use log::warn;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// Who a slot belongs to, by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotOwner {
    Original,
    Reserved,
    User,
}

impl SlotOwner {
    pub fn of(format: HeaderFormat, slot: u8) -> Self {
        if slot == ORIGINAL_SLOT {
            SlotOwner::Original
        } else if format.reserved_slot() == Some(slot) {
            SlotOwner::Reserved
        } else {
            SlotOwner::User
        }
    }
}

/// One occupied slot as seen in a report.
#[derive(Debug, Clone, Serialize)]
pub struct SlotReport {
    pub slot: u8,
    pub owner: SlotOwner,
    pub annotation: Option<SlotAnnotation>,
    /// Whether the derived key opens this slot; `None` when not tested.
    pub derived_key_opens: Option<bool>,
}

/// Per-device slot analysis used by the archive report.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSlotAnalysis {
    pub device: EncryptedDevice,
    pub uuid: Option<String>,
    pub format: Option<HeaderFormat>,
    pub slots: Vec<SlotReport>,
    pub error: Option<String>,
}

impl DeviceSlotAnalysis {
    /// Plain-text block for the metadata report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Device: {} ({})", self.device.path, self.device.role.as_str());
        let _ = writeln!(out, "  UUID: {}", self.uuid.as_deref().unwrap_or("unavailable"));
        match self.format {
            Some(format) => {
                let _ = writeln!(out, "  Format: {format} ({} slots)", format.slot_count());
            }
            None => {
                let _ = writeln!(out, "  Format: unknown");
            }
        }
        if let Some(error) = &self.error {
            let _ = writeln!(out, "  Inspection error: {error}");
            return out;
        }
        if self.slots.is_empty() {
            let _ = writeln!(out, "  No occupied slots");
        }
        for slot in &self.slots {
            let owner = match slot.owner {
                SlotOwner::Original => "original credential",
                SlotOwner::Reserved => "reserved (hardware key)",
                SlotOwner::User => "user",
            };
            let opens = match slot.derived_key_opens {
                Some(true) => "derived key opens",
                Some(false) => "derived key does not open",
                None => "not tested",
            };
            let _ = write!(out, "  Slot {:>2}: {owner}; {opens}", slot.slot);
            if let Some(annotation) = &slot.annotation {
                let _ = write!(
                    out,
                    "; token {} created {}",
                    annotation.token_type,
                    annotation.created.as_deref().unwrap_or("unknown")
                );
            }
            out.push('\n');
        }
        out
    }
}

/// Read-only view over device headers.
pub struct DeviceInspector<'a, P> {
    provider: &'a P,
}

impl<'a, P> DeviceInspector<'a, P>
where
    P: LuksProvider<Error = AutoUnlockError>,
{
    pub fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    pub fn list_encrypted_devices(&self) -> AutoUnlockResult<Vec<EncryptedDevice>> {
        let mut devices = self.provider.list_encrypted_devices()?;
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        devices.dedup_by(|a, b| a.path == b.path);
        Ok(devices)
    }

    pub fn header(&self, device: &str) -> AutoUnlockResult<HeaderMetadata> {
        self.provider.read_header(device)
    }

    pub fn header_format(&self, device: &str) -> AutoUnlockResult<HeaderFormat> {
        Ok(self.provider.read_header(device)?.format)
    }

    pub fn occupied_slots(&self, device: &str) -> AutoUnlockResult<BTreeSet<u8>> {
        Ok(self.provider.read_header(device)?.occupied_slots)
    }

    pub fn annotation_for(&self, device: &str, slot: u8) -> AutoUnlockResult<Option<SlotAnnotation>> {
        Ok(self.provider.read_header(device)?.annotation_for(slot).cloned())
    }

    /// Devices the derived key currently opens.
    pub fn unlockable_devices(
        &self,
        devices: &[EncryptedDevice],
        key: &DerivedKey,
    ) -> Vec<EncryptedDevice> {
        devices
            .iter()
            .filter(|device| {
                match self
                    .provider
                    .test_unlock(&device.path, KeyMaterial::Bytes(key.as_bytes()), None)
                {
                    Ok(opens) => opens,
                    Err(err) => {
                        warn!("unlock test on {} failed: {err}", device.path);
                        false
                    }
                }
            })
            .cloned()
            .collect()
    }

    /// Devices whose reserved slot carries a hardware-key annotation.
    pub fn devices_with_hardware_key(&self, devices: &[EncryptedDevice]) -> Vec<EncryptedDevice> {
        devices
            .iter()
            .filter(|device| match self.provider.read_header(&device.path) {
                Ok(header) => header
                    .annotation_for(RESERVED_SLOT)
                    .is_some_and(SlotAnnotation::is_hardware_key),
                Err(err) => {
                    warn!("header inspection of {} failed: {err}", device.path);
                    false
                }
            })
            .cloned()
            .collect()
    }

    /// Full slot analysis; inspection failures are recorded, not returned.
    pub fn analyze(&self, device: &EncryptedDevice, key: Option<&DerivedKey>) -> DeviceSlotAnalysis {
        let uuid = self.provider.header_uuid(&device.path).ok();
        let header = match self.provider.read_header(&device.path) {
            Ok(header) => header,
            Err(err) => {
                return DeviceSlotAnalysis {
                    device: device.clone(),
                    uuid,
                    format: None,
                    slots: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        };

        let slots = header
            .occupied_slots
            .iter()
            .map(|&slot| SlotReport {
                slot,
                owner: SlotOwner::of(header.format, slot),
                annotation: header.annotation_for(slot).cloned(),
                derived_key_opens: key.and_then(|key| {
                    self.provider
                        .test_unlock(&device.path, KeyMaterial::Bytes(key.as_bytes()), Some(slot))
                        .ok()
                }),
            })
            .collect();

        DeviceSlotAnalysis {
            device: device.clone(),
            uuid,
            format: Some(header.format),
            slots,
            error: None,
        }
    }
}
