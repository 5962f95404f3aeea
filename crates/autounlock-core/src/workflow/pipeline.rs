//! Per-device provisioning of the hardware key.
//!
//! Devices are handled strictly one after another; a failure on one device is
//! recorded and the next device is processed regardless.

use super::{event, ProcessOptions, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::archive::{self, ArchivePackager};
use crate::config::AutoUnlockConfig;
use crate::credential::Credential;
use crate::error::{AutoUnlockError, AutoUnlockResult};
use crate::fingerprint::{DerivedKey, HardwareFingerprint};
use crate::inspector::DeviceInspector;
use crate::safety::{plan_cleanup, CleanupPlan, SafetyValidator};
use autounlock_provider::luks::{
    EncryptedDevice, KeyMaterial, LuksProvider, SlotAnnotation, ORIGINAL_SLOT,
};
use chrono::{Local, SecondsFormat, Utc};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Final state of one device after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    /// Key installed (or, in a dry run, would be installed) into `slot`.
    Added { slot: u8 },
    Skipped { reason: String },
    Failed { reason: String },
}

impl DeviceOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, DeviceOutcome::Failed { .. })
    }

    fn failed(err: &AutoUnlockError) -> Self {
        DeviceOutcome::Failed {
            reason: failure_reason(err),
        }
    }
}

/// Per-device result with the evidence gathered along the way.
#[derive(Debug, Clone)]
pub struct DeviceResult {
    pub device: EncryptedDevice,
    pub outcome: DeviceOutcome,
    pub backup: Option<PathBuf>,
    pub events: Vec<WorkflowEvent>,
}

/// Whole-run result: the device partition plus archive status.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub options: ProcessOptions,
    pub results: Vec<DeviceResult>,
    pub archive: Option<PathBuf>,
    pub archive_error: Option<String>,
}

impl RunReport {
    pub fn added(&self) -> impl Iterator<Item = &DeviceResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, DeviceOutcome::Added { .. }))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &DeviceResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, DeviceOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &DeviceResult> {
        self.results.iter().filter(|r| r.outcome.is_failed())
    }

    /// At least one device did not fail.
    pub fn succeeded(&self) -> bool {
        self.results.iter().any(|r| !r.outcome.is_failed())
    }

    pub fn to_workflow_report(&self) -> WorkflowReport {
        let title = if self.options.dry_run {
            "Dry run: hardware key provisioning plan"
        } else if self.options.headers_only {
            "LUKS header backup"
        } else {
            "Hardware key provisioning"
        };
        let mut report = WorkflowReport::new(title);

        for result in &self.results {
            report.events.extend(result.events.iter().cloned());
            let path = &result.device.path;
            match &result.outcome {
                DeviceOutcome::Added { slot } if self.options.dry_run => report.push(
                    WorkflowLevel::Info,
                    format!("{path}: would install hardware key into slot {slot}"),
                ),
                DeviceOutcome::Added { slot } => report.push(
                    WorkflowLevel::Success,
                    format!("{path}: hardware key installed in slot {slot}"),
                ),
                DeviceOutcome::Skipped { reason } => {
                    report.push(WorkflowLevel::Info, format!("{path}: skipped ({reason})"))
                }
                DeviceOutcome::Failed { reason } => {
                    report.push(WorkflowLevel::Error, format!("{path}: failed ({reason})"))
                }
            }
        }

        report.push(
            WorkflowLevel::Info,
            format!(
                "Summary: {} added, {} skipped, {} failed",
                self.added().count(),
                self.skipped().count(),
                self.failed().count()
            ),
        );
        if let Some(archive) = &self.archive {
            report.push(
                WorkflowLevel::Security,
                format!("Header archive written to {}", archive.display()),
            );
        }
        if let Some(err) = &self.archive_error {
            report.push(WorkflowLevel::Error, format!("Archive not created: {err}"));
        }
        report
    }
}

/// Everything one run needs besides the provider.
pub struct ProcessRequest<'a> {
    /// `None` when the hardware identifiers could not be read. Header
    /// backups still run; key installation fails per device.
    pub fingerprint: Option<&'a HardwareFingerprint>,
    pub key: Option<&'a DerivedKey>,
    pub credential: &'a Credential,
    /// Required when `credential` is a keyfile and an archive is produced.
    pub archive_password: Option<&'a str>,
    pub options: ProcessOptions,
}

/// Drives one device through credential check, backup, cleanup, install,
/// and annotation.
pub struct DevicePipeline<'a, P> {
    provider: &'a P,
    credential: &'a Credential,
    key: Option<&'a DerivedKey>,
    options: ProcessOptions,
    install_attempts: u32,
    workdir: &'a Path,
}

impl<'a, P> DevicePipeline<'a, P>
where
    P: LuksProvider<Error = AutoUnlockError>,
{
    pub fn new(
        provider: &'a P,
        credential: &'a Credential,
        key: Option<&'a DerivedKey>,
        options: ProcessOptions,
        install_attempts: u32,
        workdir: &'a Path,
    ) -> Self {
        Self {
            provider,
            credential,
            key,
            options,
            install_attempts: install_attempts.max(1),
            workdir,
        }
    }

    pub fn process(&self, device: &EncryptedDevice) -> DeviceResult {
        let mut result = DeviceResult {
            device: device.clone(),
            outcome: DeviceOutcome::Skipped {
                reason: String::new(),
            },
            backup: None,
            events: Vec::new(),
        };
        result.outcome = match self.run(device, &mut result) {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("{}: {err}", device.path);
                DeviceOutcome::failed(&err)
            }
        };
        result
    }

    fn run(
        &self,
        device: &EncryptedDevice,
        result: &mut DeviceResult,
    ) -> AutoUnlockResult<DeviceOutcome> {
        let path = device.path.as_str();
        let validator = SafetyValidator::new(self.provider, self.credential);

        validator.require_credential(path)?;
        result.events.push(event(
            WorkflowLevel::Info,
            format!("{path}: supplied {} accepted", self.credential.kind()),
        ));

        if !self.options.dry_run {
            let backup = self.backup_header(path)?;
            result.events.push(event(
                WorkflowLevel::Info,
                format!("{path}: header backed up"),
            ));
            result.backup = Some(backup);
        }

        if self.options.headers_only {
            return Ok(DeviceOutcome::Skipped {
                reason: "headers only".into(),
            });
        }

        let Some(key) = self.key else {
            return Err(AutoUnlockError::HardwareUnavailable(
                "no derived key for this run".into(),
            ));
        };

        if self.key_already_works(path, key) {
            return Ok(DeviceOutcome::Skipped {
                reason: "hardware key already unlocks device".into(),
            });
        }

        let header = self.provider.read_header(path)?;
        let plan = plan_cleanup(self.provider, path, self.credential, &header)?;
        result.events.extend(
            plan.evidence
                .iter()
                .map(|line| event(WorkflowLevel::Info, format!("{path}: {line}"))),
        );
        let slot = plan.install_slot.ok_or_else(|| AutoUnlockError::SafetyAbort {
            device: path.to_string(),
            reason: "no free key slot available".into(),
        })?;

        if self.options.dry_run {
            for removed in &plan.remove_slots {
                result.events.push(event(
                    WorkflowLevel::Warn,
                    format!("{path}: would remove slot {removed}"),
                ));
            }
            return Ok(DeviceOutcome::Added { slot });
        }

        let mut mutated = false;
        let applied = self
            .apply_cleanup(path, &plan, result, &mut mutated)
            .and_then(|()| self.install(path, slot, key));
        if let Err(err) = applied {
            if mutated {
                return Err(self.roll_back(path, slot, result, err));
            }
            return Err(err);
        }

        if header.format.supports_annotations() {
            let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let annotation = SlotAnnotation::hardware_key(slot, created);
            match self.provider.import_annotation(path, &annotation) {
                Ok(()) => result.events.push(event(
                    WorkflowLevel::Info,
                    format!("{path}: slot {slot} annotated"),
                )),
                Err(err) => {
                    warn!("{path}: annotation write failed: {err}");
                    result.events.push(event(
                        WorkflowLevel::Warn,
                        format!("{path}: key installed but annotation failed: {err}"),
                    ));
                }
            }
        }

        info!("{path}: hardware key installed in slot {slot}");
        Ok(DeviceOutcome::Added { slot })
    }

    fn backup_header(&self, device: &str) -> AutoUnlockResult<PathBuf> {
        let uuid = self
            .provider
            .header_uuid(device)
            .map_err(|err| AutoUnlockError::BackupFailed {
                device: device.to_string(),
                reason: format!("read UUID: {err}"),
            })?;
        let destination = self.workdir.join(backup_file_name(device, &uuid));
        self.provider
            .backup_header(device, &destination)
            .map_err(|err| AutoUnlockError::BackupFailed {
                device: device.to_string(),
                reason: err.to_string(),
            })?;
        if !destination.exists() {
            return Err(AutoUnlockError::BackupFailed {
                device: device.to_string(),
                reason: "backup file was not written".into(),
            });
        }
        Ok(destination)
    }

    fn key_already_works(&self, device: &str, key: &DerivedKey) -> bool {
        match self
            .provider
            .test_unlock(device, KeyMaterial::Bytes(key.as_bytes()), None)
        {
            Ok(opens) => opens,
            Err(err) => {
                warn!("{device}: hardware key test failed: {err}");
                false
            }
        }
    }

    /// Sets `mutated` once the header has changed.
    fn apply_cleanup(
        &self,
        device: &str,
        plan: &CleanupPlan,
        result: &mut DeviceResult,
        mutated: &mut bool,
    ) -> AutoUnlockResult<()> {
        for token_id in &plan.remove_tokens {
            match self.provider.remove_annotation(device, *token_id) {
                Ok(()) => {
                    *mutated = true;
                    result.events.push(event(
                        WorkflowLevel::Info,
                        format!("{device}: removed stale annotation token {token_id}"),
                    ));
                }
                Err(err) => result.events.push(event(
                    WorkflowLevel::Warn,
                    format!("{device}: could not remove annotation token {token_id}: {err}"),
                )),
            }
        }

        for &slot in &plan.remove_slots {
            if slot == ORIGINAL_SLOT {
                return Err(AutoUnlockError::SafetyAbort {
                    device: device.to_string(),
                    reason: "refusing to remove the original credential slot".into(),
                });
            }
            warn!(
                "{device}: removing slot {slot}; evidence: {}",
                plan.evidence.join("; ")
            );
            self.provider
                .remove_slot(device, slot, self.credential.key_material())
                .map_err(|err| AutoUnlockError::SlotOperationFailed {
                    device: device.to_string(),
                    slot,
                    reason: err.to_string(),
                })?;
            *mutated = true;
            result.events.push(event(
                WorkflowLevel::Security,
                format!("{device}: removed unreachable slot {slot}"),
            ));
        }
        Ok(())
    }

    fn install(&self, device: &str, slot: u8, key: &DerivedKey) -> AutoUnlockResult<()> {
        let mut last_error = None;
        for attempt in 1..=self.install_attempts {
            match self.provider.add_key(
                device,
                self.credential.key_material(),
                key.as_bytes(),
                Some(slot),
            ) {
                Ok(()) => return Ok(()),
                Err(err @ AutoUnlockError::SlotOccupied { .. }) => {
                    error!("{device}: slot {slot} occupied at install time; safety checks missed it");
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "{device}: install attempt {attempt}/{} failed: {err}",
                        self.install_attempts
                    );
                    last_error = Some(err);
                }
            }
        }
        let reason = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        Err(AutoUnlockError::SlotOperationFailed {
            device: device.to_string(),
            slot,
            reason,
        })
    }

    fn roll_back(
        &self,
        device: &str,
        slot: u8,
        result: &mut DeviceResult,
        cause: AutoUnlockError,
    ) -> AutoUnlockError {
        let Some(backup) = result.backup.as_deref() else {
            return cause;
        };
        match self.provider.restore_header(device, backup) {
            Ok(()) => {
                result.events.push(event(
                    WorkflowLevel::Warn,
                    format!("{device}: {cause}; header restored from backup"),
                ));
                cause
            }
            Err(restore_err) => {
                error!("{device}: header restore failed: {restore_err}");
                result.events.push(event(
                    WorkflowLevel::Error,
                    format!("{device}: header restore failed: {restore_err}"),
                ));
                AutoUnlockError::SlotOperationFailed {
                    device: device.to_string(),
                    slot,
                    reason: format!("{cause}; rollback failed: {restore_err}"),
                }
            }
        }
    }
}

/// Process every encrypted device, then archive the header backups.
///
/// Device failures never abort the run. `NoEncryptedDevices` is the only
/// run-level error; archive failures are recorded in the report.
pub fn process_devices<P, A>(
    config: &AutoUnlockConfig,
    provider: &P,
    packager: &A,
    request: &ProcessRequest<'_>,
) -> AutoUnlockResult<RunReport>
where
    P: LuksProvider<Error = AutoUnlockError>,
    A: ArchivePackager,
{
    let inspector = DeviceInspector::new(provider);
    let devices = inspector.list_encrypted_devices()?;
    if devices.is_empty() {
        return Err(AutoUnlockError::NoEncryptedDevices);
    }

    let workdir = TempDir::new()?;
    let pipeline = DevicePipeline::new(
        provider,
        request.credential,
        request.key,
        request.options,
        config.retry.install_attempts,
        workdir.path(),
    );

    let mut report = RunReport {
        options: request.options,
        ..RunReport::default()
    };
    for device in &devices {
        info!("processing {} ({})", device.path, device.role.as_str());
        report.results.push(pipeline.process(device));
    }

    let backups: Vec<PathBuf> = report
        .results
        .iter()
        .filter_map(|r| r.backup.clone())
        .collect();
    if request.options.dry_run || backups.is_empty() {
        return Ok(report);
    }

    match package_backups(config, &inspector, packager, request, &devices, &backups, workdir.path()) {
        Ok(archive) => report.archive = Some(archive),
        Err(err) => {
            error!("archive step failed: {err}");
            report.archive_error = Some(err.to_string());
        }
    }
    Ok(report)
}

fn package_backups<P, A>(
    config: &AutoUnlockConfig,
    inspector: &DeviceInspector<'_, P>,
    packager: &A,
    request: &ProcessRequest<'_>,
    devices: &[EncryptedDevice],
    backups: &[PathBuf],
    workdir: &Path,
) -> AutoUnlockResult<PathBuf>
where
    P: LuksProvider<Error = AutoUnlockError>,
    A: ArchivePackager,
{
    let password = archive::archive_password(request.credential, request.archive_password)?;
    let now = Local::now();
    let analyses: Vec<_> = devices
        .iter()
        .map(|device| inspector.analyze(device, request.key))
        .collect();
    let report = archive::render_report(request.fingerprint, request.key, &analyses, &now);
    archive::build_archive(
        packager,
        &config.archive_dir(request.options.download_mode),
        workdir,
        password,
        backups,
        &report,
        &now,
    )
}

/// `<basename>_<uuid>.img`
fn backup_file_name(device: &str, uuid: &str) -> String {
    let base = Path::new(device)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.replace('/', "_"));
    format!("{base}_{}.img", uuid.trim())
}

fn failure_reason(err: &AutoUnlockError) -> String {
    match err {
        AutoUnlockError::SafetyAbort { reason, .. } => reason.clone(),
        AutoUnlockError::CredentialInvalid { .. } => "credential invalid".into(),
        AutoUnlockError::SlotOccupied { slot, .. } => {
            format!("slot {slot} occupied at install (logic error)")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn backup_names_use_basename_and_uuid() {
        assert_eq!(
            backup_file_name("/dev/md1p1", "1234-abcd\n"),
            "md1p1_1234-abcd.img"
        );
    }

    #[test]
    fn slot_occupied_reason_is_distinct() {
        let reason = failure_reason(&AutoUnlockError::SlotOccupied {
            device: "/dev/sdb1".into(),
            slot: 31,
        });
        assert!(reason.contains("logic error"));
    }
}
