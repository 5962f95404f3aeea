//! Error taxonomy shared by every auto-unlock workflow.
//!
//! Device-scoped variants (`CredentialInvalid`, `SafetyAbort`, `SlotOperationFailed`,
//! `SlotOccupied`, `BackupFailed`) are captured per device by the pipeline and never
//! abort a run. The remaining variants are run- or process-scoped.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutoUnlockError {
    #[error("hardware fingerprint unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("supplied credential does not unlock {device}")]
    CredentialInvalid { device: String },

    #[error("safety check refused to modify {device}: {reason}")]
    SafetyAbort { device: String, reason: String },

    #[error("slot operation on {device} slot {slot} failed: {reason}")]
    SlotOperationFailed {
        device: String,
        slot: u8,
        reason: String,
    },

    #[error("slot {slot} on {device} is already occupied")]
    SlotOccupied { device: String, slot: u8 },

    #[error("header backup for {device} failed: {reason}")]
    BackupFailed { device: String, reason: String },

    #[error("archive creation failed: {0}")]
    ArchiveFailed(String),

    #[error("configuration and hook state disagree: {0}")]
    ConfigInconsistent(String),

    #[error("no encrypted devices found")]
    NoEncryptedDevices,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid key material at {path}: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type AutoUnlockResult<T> = Result<T, AutoUnlockError>;
