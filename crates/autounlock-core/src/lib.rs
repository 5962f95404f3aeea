//! Core building blocks shared by the auto-unlock binaries.
//!
//! Key derivation, slot safety, the provisioning pipeline, and readiness live
//! here; provider crates supply the system bindings and the CLI is a thin
//! operator surface.

pub mod archive;
pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod fingerprint;
pub mod inspector;
pub mod keyfile;
pub mod logging;
pub mod process;
pub mod readiness;
pub mod safety;
pub mod workflow;

pub use config::{AutoUnlockConfig, ConfigFormat, ConfigStore, FileConfigStore};
pub use controller::{Controller, HookStatus};
pub use credential::Credential;
pub use error::{AutoUnlockError, AutoUnlockResult};
pub use fingerprint::{derive_key, DerivedKey, HardwareFingerprint};
pub use readiness::{Readiness, ReadinessState};
pub use safety::{CleanupStrategy, ReservedSlotState, SafetyDecision};
pub use workflow::{ProcessOptions, WorkflowEvent, WorkflowLevel, WorkflowReport};
