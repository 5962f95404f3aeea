//! Provider contract for LUKS header and key-slot operations.
//!
//! Every mutation of a LUKS header goes through `LuksProvider`. The trait is
//! deliberately thin: it mirrors the `cryptsetup` actions the workflows need
//! and leaves every safety decision to the caller.

use serde::Serialize;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::path::Path;

/// Slot holding the operator's original credential. Never mutated.
pub const ORIGINAL_SLOT: u8 = 0;

/// Highest LUKS2 slot, reserved for the hardware-derived key.
pub const RESERVED_SLOT: u8 = 31;

/// Token type tag written next to the hardware-derived key.
pub const ANNOTATION_TYPE: &str = "autounlock-hwkey";

/// On-disk header version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeaderFormat {
    V1,
    V2,
}

impl HeaderFormat {
    /// Number of key slots the format supports.
    pub fn slot_count(self) -> u8 {
        match self {
            HeaderFormat::V1 => 8,
            HeaderFormat::V2 => 32,
        }
    }

    /// The reserved slot, when the format has one.
    pub fn reserved_slot(self) -> Option<u8> {
        match self {
            HeaderFormat::V1 => None,
            HeaderFormat::V2 => Some(RESERVED_SLOT),
        }
    }

    /// Whether the format can carry slot annotations (tokens).
    pub fn supports_annotations(self) -> bool {
        matches!(self, HeaderFormat::V2)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HeaderFormat::V1 => "LUKS1",
            HeaderFormat::V2 => "LUKS2",
        }
    }
}

impl fmt::Display for HeaderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informational classification of a discovered device. Has no effect on
/// safety decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceRole {
    Array,
    PoolMember,
    Standalone,
}

impl DeviceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Array => "array",
            DeviceRole::PoolMember => "pool-member",
            DeviceRole::Standalone => "standalone",
        }
    }
}

/// A block device carrying a LUKS header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedDevice {
    /// Device node, e.g. `/dev/md1p1` or `/dev/nvme0n1p1`.
    pub path: String,
    pub role: DeviceRole,
}

/// Non-secret metadata record attached to one or more slots (a LUKS2 token).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAnnotation {
    /// Token id assigned by the header; `None` for a record not yet imported.
    pub token_id: Option<u32>,
    pub token_type: String,
    pub keyslots: Vec<u8>,
    /// RFC 3339 generation timestamp.
    pub created: Option<String>,
}

impl SlotAnnotation {
    /// Build the annotation written after installing a hardware key.
    pub fn hardware_key(slot: u8, created: impl Into<String>) -> Self {
        Self {
            token_id: None,
            token_type: ANNOTATION_TYPE.to_string(),
            keyslots: vec![slot],
            created: Some(created.into()),
        }
    }

    pub fn is_hardware_key(&self) -> bool {
        self.token_type == ANNOTATION_TYPE
    }

    pub fn references(&self, slot: u8) -> bool {
        self.keyslots.contains(&slot)
    }
}

/// Snapshot of a device header as reported by the encryption utility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderMetadata {
    pub format: HeaderFormat,
    pub occupied_slots: BTreeSet<u8>,
    pub annotations: Vec<SlotAnnotation>,
}

impl HeaderMetadata {
    pub fn is_occupied(&self, slot: u8) -> bool {
        self.occupied_slots.contains(&slot)
    }

    /// Annotation joined to `slot` through its slot reference list.
    ///
    /// Annotations only exist on V2 headers; tokens that reference no
    /// occupied slot are never returned.
    pub fn annotation_for(&self, slot: u8) -> Option<&SlotAnnotation> {
        if !self.format.supports_annotations() || !self.is_occupied(slot) {
            return None;
        }
        self.annotations.iter().find(|a| a.references(slot))
    }

    /// Hardware-key annotations whose referenced slots are all empty.
    pub fn orphaned_annotations(&self) -> Vec<&SlotAnnotation> {
        self.annotations
            .iter()
            .filter(|a| a.is_hardware_key())
            .filter(|a| !a.keyslots.iter().any(|slot| self.is_occupied(*slot)))
            .collect()
    }

    /// First free slot, skipping the original-credential slot.
    pub fn first_free_slot(&self) -> Option<u8> {
        (1..self.format.slot_count()).find(|slot| !self.is_occupied(*slot))
    }
}

/// Borrowed key material handed to the encryption utility.
#[derive(Clone, Copy)]
pub enum KeyMaterial<'a> {
    /// Raw passphrase bytes, streamed on stdin.
    Bytes(&'a [u8]),
    /// Keyfile on disk, passed by path.
    File(&'a Path),
}

impl fmt::Debug for KeyMaterial<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Bytes(bytes) => write!(f, "KeyMaterial::Bytes(<{} bytes>)", bytes.len()),
            KeyMaterial::File(path) => write!(f, "KeyMaterial::File({})", path.display()),
        }
    }
}

/// Abstraction over the external LUKS management utility.
pub trait LuksProvider {
    type Error: Error + Send + Sync + 'static;

    /// Enumerate block devices carrying a LUKS header.
    fn list_encrypted_devices(&self) -> Result<Vec<EncryptedDevice>, Self::Error>;

    /// Read header format, occupied slots, and annotations.
    fn read_header(&self, device: &str) -> Result<HeaderMetadata, Self::Error>;

    /// Return the header UUID.
    fn header_uuid(&self, device: &str) -> Result<String, Self::Error>;

    /// Return whether `key` opens the device, optionally restricted to one slot.
    ///
    /// A rejected key is `Ok(false)`; `Err` is reserved for failures that say
    /// nothing about the key (missing device, utility not executable).
    fn test_unlock(
        &self,
        device: &str,
        key: KeyMaterial<'_>,
        slot: Option<u8>,
    ) -> Result<bool, Self::Error>;

    /// Add `new_key`, authorised by `existing`, into `slot` (or any free slot).
    fn add_key(
        &self,
        device: &str,
        existing: KeyMaterial<'_>,
        new_key: &[u8],
        slot: Option<u8>,
    ) -> Result<(), Self::Error>;

    /// Destroy the key in `slot`, authorised by `authorizing`.
    fn remove_slot(
        &self,
        device: &str,
        slot: u8,
        authorizing: KeyMaterial<'_>,
    ) -> Result<(), Self::Error>;

    /// Write a full header backup to `destination`.
    fn backup_header(&self, device: &str, destination: &Path) -> Result<(), Self::Error>;

    /// Restore the header from a backup produced by `backup_header`.
    fn restore_header(&self, device: &str, source: &Path) -> Result<(), Self::Error>;

    /// Attach an annotation to the header.
    fn import_annotation(&self, device: &str, annotation: &SlotAnnotation)
        -> Result<(), Self::Error>;

    /// Remove the annotation with `token_id`.
    fn remove_annotation(&self, device: &str, token_id: u32) -> Result<(), Self::Error>;
}
