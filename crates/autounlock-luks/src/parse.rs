//! Parsers for `cryptsetup luksDump` and `lsblk -J` output.
//!
//! LUKS2 metadata comes from the structured JSON export. The human-readable
//! dump is only scanned for the `Version:` line and LUKS1 slot status, which
//! have no structured form.

use autounlock_core::error::{AutoUnlockError, AutoUnlockResult};
use autounlock_provider::luks::{DeviceRole, EncryptedDevice, HeaderFormat, SlotAnnotation};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const LUKS_FSTYPE: &str = "crypto_LUKS";
const ARRAY_PREFIX: &str = "/dev/md";
const MOUNT_ROOT: &str = "/mnt/";
const ARRAY_MOUNTS: &[&str] = &["/mnt/disk", "/mnt/user", "/mnt/addons", "/mnt/remotes", "/mnt/disks"];

/// Header version from the `Version:` line of `luksDump`.
pub(crate) fn parse_version(dump: &str) -> AutoUnlockResult<HeaderFormat> {
    for line in dump.lines() {
        let Some(rest) = line.trim().strip_prefix("Version:") else {
            continue;
        };
        return match rest.trim() {
            "1" => Ok(HeaderFormat::V1),
            "2" => Ok(HeaderFormat::V2),
            other => Err(AutoUnlockError::Provider(format!(
                "unsupported LUKS header version `{other}`"
            ))),
        };
    }
    Err(AutoUnlockError::Provider(
        "luksDump output has no Version line".into(),
    ))
}

/// Enabled slots from a LUKS1 `luksDump` (`Key Slot N: ENABLED`).
pub(crate) fn parse_v1_slots(dump: &str) -> BTreeSet<u8> {
    dump.lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Key Slot ")?;
            let (index, status) = rest.split_once(':')?;
            let index: u8 = index.trim().parse().ok()?;
            (status.trim() == "ENABLED" && index < HeaderFormat::V1.slot_count()).then_some(index)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct Luks2Metadata {
    #[serde(default)]
    keyslots: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    tokens: BTreeMap<String, Luks2Token>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct Luks2Token {
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde(default)]
    pub keyslots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

/// Occupied slots and annotations from `luksDump --dump-json-metadata`.
pub(crate) fn parse_v2_metadata(json: &str) -> AutoUnlockResult<(BTreeSet<u8>, Vec<SlotAnnotation>)> {
    let metadata: Luks2Metadata = serde_json::from_str(json)?;

    let slots = metadata
        .keyslots
        .keys()
        .filter_map(|id| id.parse::<u8>().ok())
        .filter(|id| *id < HeaderFormat::V2.slot_count())
        .collect();

    let annotations = metadata
        .tokens
        .into_iter()
        .filter_map(|(id, token)| {
            let token_id = id.parse::<u32>().ok()?;
            let keyslots: Vec<u8> = token
                .keyslots
                .iter()
                .filter_map(|slot| slot.parse::<u8>().ok())
                .collect();
            if keyslots.is_empty() {
                debug!("token {token_id} references no key slot");
            }
            Some(SlotAnnotation {
                token_id: Some(token_id),
                token_type: token.token_type,
                keyslots,
                created: token.created,
            })
        })
        .collect();

    Ok((slots, annotations))
}

/// JSON document for `cryptsetup token import`.
pub(crate) fn token_json(annotation: &SlotAnnotation) -> AutoUnlockResult<String> {
    let token = Luks2Token {
        token_type: annotation.token_type.clone(),
        keyslots: annotation.keyslots.iter().map(u8::to_string).collect(),
        created: annotation.created.clone(),
    };
    Ok(serde_json::to_string(&token)?)
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn mounts(&self) -> impl Iterator<Item = &str> {
        self.mountpoint
            .iter()
            .chain(self.mountpoints.iter().flatten())
            .map(String::as_str)
    }

    fn descendant_mounts(&self) -> Vec<&str> {
        let mut mounts: Vec<&str> = self.mounts().collect();
        for child in &self.children {
            mounts.extend(child.descendant_mounts());
        }
        mounts
    }
}

/// Encrypted devices from `lsblk -J -p -o NAME,FSTYPE,TYPE,MOUNTPOINT`.
pub(crate) fn parse_lsblk(json: &str) -> AutoUnlockResult<Vec<EncryptedDevice>> {
    let output: LsblkOutput = serde_json::from_str(json)?;
    let mut devices = Vec::new();
    for device in &output.blockdevices {
        collect_luks(device, &mut devices);
    }
    Ok(devices)
}

fn collect_luks(device: &LsblkDevice, out: &mut Vec<EncryptedDevice>) {
    if device.fstype.as_deref() == Some(LUKS_FSTYPE) {
        out.push(EncryptedDevice {
            path: device.name.clone(),
            role: classify_role(device),
        });
    }
    for child in &device.children {
        collect_luks(child, out);
    }
}

fn classify_role(device: &LsblkDevice) -> DeviceRole {
    if device.name.starts_with(ARRAY_PREFIX) {
        return DeviceRole::Array;
    }
    let pooled = device.descendant_mounts().into_iter().any(|mount| {
        mount.starts_with(MOUNT_ROOT) && !ARRAY_MOUNTS.iter().any(|prefix| mount.starts_with(prefix))
    });
    if pooled {
        DeviceRole::PoolMember
    } else {
        DeviceRole::Standalone
    }
}
