use super::*;
use crate::archive::ArchivePackager;
use crate::config::{AutoUnlockConfig, ConfigStore};
use crate::controller::Controller;
use crate::credential::Credential;
use crate::error::{AutoUnlockError, AutoUnlockResult};
use crate::fingerprint::{DerivedKey, HardwareFingerprint};
use crate::readiness::{Readiness, ReadinessState};
use autounlock_provider::hardware::{DefaultRoute, HardwareProbe};
use autounlock_provider::host::ArrayProbe;
use autounlock_provider::luks::{
    DeviceRole, EncryptedDevice, HeaderFormat, HeaderMetadata, KeyMaterial, LuksProvider,
    SlotAnnotation, ANNOTATION_TYPE, RESERVED_SLOT,
};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

const SERIAL: &str = "SER-0001";
const MAC: &str = "aa:bb:cc:dd:ee:ff";
const PASS: &[u8] = b"operator-pass";

fn fingerprint() -> HardwareFingerprint {
    HardwareFingerprint::new(SERIAL, MAC).unwrap()
}

fn derived() -> DerivedKey {
    fingerprint().derive()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    AddKey { device: String, slot: Option<u8> },
    RemoveSlot { device: String, slot: u8 },
    Backup { device: String },
    Restore { device: String },
    ImportToken { device: String },
    RemoveToken { device: String, token_id: u32 },
}

impl Call {
    fn mutates_slots(&self) -> bool {
        matches!(
            self,
            Call::AddKey { .. }
                | Call::RemoveSlot { .. }
                | Call::Restore { .. }
                | Call::ImportToken { .. }
                | Call::RemoveToken { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct MockDevice {
    format: HeaderFormat,
    uuid: String,
    slots: BTreeMap<u8, Vec<u8>>,
    tokens: BTreeMap<u32, SlotAnnotation>,
    add_failures: u32,
    add_reports_occupied: bool,
    annotation_fails: bool,
    remove_fails: bool,
    restore_fails: bool,
}

impl MockDevice {
    fn new(format: HeaderFormat, slots: &[(u8, &[u8])]) -> Self {
        Self {
            format,
            uuid: "0000-uuid".into(),
            slots: slots.iter().map(|(s, k)| (*s, k.to_vec())).collect(),
            tokens: BTreeMap::new(),
            add_failures: 0,
            add_reports_occupied: false,
            annotation_fails: false,
            remove_fails: false,
            restore_fails: false,
        }
    }

    fn with_token(mut self, token_id: u32, token_type: &str, slots: &[u8]) -> Self {
        self.tokens.insert(
            token_id,
            SlotAnnotation {
                token_id: Some(token_id),
                token_type: token_type.into(),
                keyslots: slots.to_vec(),
                created: Some("2025-01-01T00:00:00Z".into()),
            },
        );
        self
    }

    fn opens(&self, key: &[u8], slot: Option<u8>) -> bool {
        match slot {
            Some(slot) => self.slots.get(&slot).is_some_and(|k| k == key),
            None => self.slots.values().any(|k| k == key),
        }
    }
}

#[derive(Clone, Default)]
struct MockLuks {
    devices: Arc<Mutex<BTreeMap<String, MockDevice>>>,
    backups: Arc<Mutex<HashMap<PathBuf, MockDevice>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MockLuks {
    fn with(devices: Vec<(&str, MockDevice)>) -> Self {
        let provider = MockLuks::default();
        {
            let mut map = provider.devices.lock().unwrap();
            for (path, device) in devices {
                map.insert(path.to_string(), device);
            }
        }
        provider
    }

    fn device(&self, path: &str) -> MockDevice {
        self.devices.lock().unwrap().get(path).cloned().unwrap()
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::mutates_slots).collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn key_bytes(key: KeyMaterial<'_>) -> Vec<u8> {
        match key {
            KeyMaterial::Bytes(bytes) => bytes.to_vec(),
            KeyMaterial::File(path) => fs::read(path).unwrap_or_default(),
        }
    }

    fn missing(device: &str) -> AutoUnlockError {
        AutoUnlockError::Provider(format!("no such device {device}"))
    }
}

impl LuksProvider for MockLuks {
    type Error = AutoUnlockError;

    fn list_encrypted_devices(&self) -> AutoUnlockResult<Vec<EncryptedDevice>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .keys()
            .map(|path| EncryptedDevice {
                path: path.clone(),
                role: DeviceRole::Array,
            })
            .collect())
    }

    fn read_header(&self, device: &str) -> AutoUnlockResult<HeaderMetadata> {
        let guard = self.devices.lock().unwrap();
        let dev = guard.get(device).ok_or_else(|| Self::missing(device))?;
        Ok(HeaderMetadata {
            format: dev.format,
            occupied_slots: dev.slots.keys().copied().collect(),
            annotations: dev.tokens.values().cloned().collect(),
        })
    }

    fn header_uuid(&self, device: &str) -> AutoUnlockResult<String> {
        let guard = self.devices.lock().unwrap();
        Ok(guard.get(device).ok_or_else(|| Self::missing(device))?.uuid.clone())
    }

    fn test_unlock(
        &self,
        device: &str,
        key: KeyMaterial<'_>,
        slot: Option<u8>,
    ) -> AutoUnlockResult<bool> {
        let guard = self.devices.lock().unwrap();
        let dev = guard.get(device).ok_or_else(|| Self::missing(device))?;
        Ok(dev.opens(&Self::key_bytes(key), slot))
    }

    fn add_key(
        &self,
        device: &str,
        existing: KeyMaterial<'_>,
        new_key: &[u8],
        slot: Option<u8>,
    ) -> AutoUnlockResult<()> {
        self.record(Call::AddKey {
            device: device.into(),
            slot,
        });
        let mut guard = self.devices.lock().unwrap();
        let dev = guard.get_mut(device).ok_or_else(|| Self::missing(device))?;
        let target = slot.unwrap_or(1);
        if dev.add_reports_occupied || dev.slots.contains_key(&target) {
            return Err(AutoUnlockError::SlotOccupied {
                device: device.into(),
                slot: target,
            });
        }
        if dev.add_failures > 0 {
            dev.add_failures -= 1;
            return Err(AutoUnlockError::SlotOperationFailed {
                device: device.into(),
                slot: target,
                reason: "simulated failure".into(),
            });
        }
        if !dev.opens(&Self::key_bytes(existing), None) {
            return Err(AutoUnlockError::CredentialInvalid {
                device: device.into(),
            });
        }
        dev.slots.insert(target, new_key.to_vec());
        Ok(())
    }

    fn remove_slot(
        &self,
        device: &str,
        slot: u8,
        _authorizing: KeyMaterial<'_>,
    ) -> AutoUnlockResult<()> {
        self.record(Call::RemoveSlot {
            device: device.into(),
            slot,
        });
        let mut guard = self.devices.lock().unwrap();
        let dev = guard.get_mut(device).ok_or_else(|| Self::missing(device))?;
        if dev.remove_fails {
            return Err(AutoUnlockError::Provider("keyslot wipe rejected".into()));
        }
        dev.slots.remove(&slot);
        Ok(())
    }

    fn backup_header(&self, device: &str, destination: &Path) -> AutoUnlockResult<()> {
        self.record(Call::Backup {
            device: device.into(),
        });
        let snapshot = self.device(device);
        fs::write(destination, b"LUKS header")?;
        self.backups
            .lock()
            .unwrap()
            .insert(destination.to_path_buf(), snapshot);
        Ok(())
    }

    fn restore_header(&self, device: &str, source: &Path) -> AutoUnlockResult<()> {
        self.record(Call::Restore {
            device: device.into(),
        });
        if self.device(device).restore_fails {
            return Err(AutoUnlockError::Provider("header restore rejected".into()));
        }
        let snapshot = self
            .backups
            .lock()
            .unwrap()
            .get(source)
            .cloned()
            .ok_or_else(|| AutoUnlockError::Provider("unknown backup".into()))?;
        let mut restored = snapshot;
        restored.add_failures = 0;
        self.devices
            .lock()
            .unwrap()
            .insert(device.to_string(), restored);
        Ok(())
    }

    fn import_annotation(&self, device: &str, annotation: &SlotAnnotation) -> AutoUnlockResult<()> {
        self.record(Call::ImportToken {
            device: device.into(),
        });
        let mut guard = self.devices.lock().unwrap();
        let dev = guard.get_mut(device).ok_or_else(|| Self::missing(device))?;
        if dev.annotation_fails {
            return Err(AutoUnlockError::Provider("token import rejected".into()));
        }
        let id = dev.tokens.keys().next_back().map_or(0, |id| id + 1);
        let mut stored = annotation.clone();
        stored.token_id = Some(id);
        dev.tokens.insert(id, stored);
        Ok(())
    }

    fn remove_annotation(&self, device: &str, token_id: u32) -> AutoUnlockResult<()> {
        self.record(Call::RemoveToken {
            device: device.into(),
            token_id,
        });
        let mut guard = self.devices.lock().unwrap();
        let dev = guard.get_mut(device).ok_or_else(|| Self::missing(device))?;
        dev.tokens.remove(&token_id);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingPackager {
    archives: Arc<Mutex<Vec<(PathBuf, String, usize)>>>,
}

impl ArchivePackager for RecordingPackager {
    fn package(&self, archive: &Path, password: &str, files: &[PathBuf]) -> AutoUnlockResult<()> {
        fs::write(archive, b"7z")?;
        self.archives
            .lock()
            .unwrap()
            .push((archive.to_path_buf(), password.to_string(), files.len()));
        Ok(())
    }
}

fn test_config(dir: &Path) -> AutoUnlockConfig {
    let mut config = AutoUnlockConfig::default();
    config.paths.backup_dir = dir.join("backups").to_string_lossy().into_owned();
    config.paths.download_dir = dir.join("downloads").to_string_lossy().into_owned();
    config.paths.hook_source_dir = dir.join("hooks").to_string_lossy().into_owned();
    config.paths.events_root = dir.join("event").to_string_lossy().into_owned();
    config
}

fn run_with(
    provider: &MockLuks,
    credential: &Credential,
    archive_password: Option<&str>,
    options: ProcessOptions,
    dir: &Path,
) -> (RunReport, RecordingPackager) {
    let packager = RecordingPackager::default();
    let config = test_config(dir);
    let fp = fingerprint();
    let key = derived();
    let request = ProcessRequest {
        fingerprint: Some(&fp),
        key: Some(&key),
        credential,
        archive_password,
        options,
    };
    let report = process_devices(&config, provider, &packager, &request).unwrap();
    (report, packager)
}

fn run_without_hardware_key(
    provider: &MockLuks,
    options: ProcessOptions,
) -> (RunReport, RecordingPackager, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let packager = RecordingPackager::default();
    let credential = Credential::passphrase("operator-pass");
    let request = ProcessRequest {
        fingerprint: None,
        key: None,
        credential: &credential,
        archive_password: None,
        options,
    };
    let report =
        process_devices(&test_config(dir.path()), provider, &packager, &request).unwrap();
    (report, packager, dir)
}

fn run(
    provider: &MockLuks,
    options: ProcessOptions,
) -> (RunReport, RecordingPackager, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let credential = Credential::passphrase("operator-pass");
    let (report, packager) = run_with(provider, &credential, None, options, dir.path());
    (report, packager, dir)
}

fn outcome(report: &RunReport, device: &str) -> DeviceOutcome {
    report
        .results
        .iter()
        .find(|r| r.device.path == device)
        .map(|r| r.outcome.clone())
        .unwrap()
}

#[test]
fn empty_reserved_slot_receives_key_and_annotation() {
    let provider = MockLuks::with(vec![(
        "/dev/md1p1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS)]),
    )]);

    let (report, packager, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(outcome(&report, "/dev/md1p1"), DeviceOutcome::Added { slot: RESERVED_SLOT });
    let device = provider.device("/dev/md1p1");
    assert_eq!(device.slots.get(&RESERVED_SLOT).unwrap(), derived().as_bytes());
    assert_eq!(device.slots.get(&0).unwrap(), PASS);
    let token = device.tokens.values().next().unwrap();
    assert_eq!(token.token_type, ANNOTATION_TYPE);
    assert_eq!(token.keyslots, vec![RESERVED_SLOT]);
    assert!(provider.calls().contains(&Call::Backup {
        device: "/dev/md1p1".into()
    }));

    assert!(report.succeeded());
    assert!(report.archive.as_ref().unwrap().exists());
    let archives = packager.archives.lock().unwrap();
    assert_eq!(archives[0].1, "operator-pass");
    assert_eq!(archives[0].2, 2, "one backup plus the report");
}

#[test]
fn unreachable_foreign_key_in_reserved_slot_is_reclaimed() {
    let provider = MockLuks::with(vec![(
        "/dev/sdb1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, b"someone-else")]),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(outcome(&report, "/dev/sdb1"), DeviceOutcome::Added { slot: 31 });
    assert!(provider.calls().contains(&Call::RemoveSlot {
        device: "/dev/sdb1".into(),
        slot: 31
    }));
    assert_eq!(
        provider.device("/dev/sdb1").slots.get(&31).unwrap(),
        derived().as_bytes()
    );
}

#[test]
fn reserved_slot_openable_by_credential_is_protected() {
    let provider = MockLuks::with(vec![(
        "/dev/sdc1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, PASS)]),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(
        outcome(&report, "/dev/sdc1"),
        DeviceOutcome::Failed {
            reason: "slot protected".into()
        }
    );
    assert!(provider.mutations().is_empty());
    assert_eq!(provider.device("/dev/sdc1").slots.get(&31).unwrap(), PASS);
}

#[test]
fn annotated_slot_still_protected_when_credential_opens_it() {
    let provider = MockLuks::with(vec![(
        "/dev/sdc1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, PASS)]).with_token(
            0,
            ANNOTATION_TYPE,
            &[31],
        ),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert!(outcome(&report, "/dev/sdc1").is_failed());
    assert!(provider.mutations().is_empty());
}

#[test]
fn working_key_is_skipped_without_mutation() {
    let key = derived();
    let provider = MockLuks::with(vec![(
        "/dev/md2p1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, key.as_bytes())]),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert!(matches!(
        outcome(&report, "/dev/md2p1"),
        DeviceOutcome::Skipped { .. }
    ));
    assert!(provider.mutations().is_empty());
}

#[test]
fn invalid_credential_fails_only_that_device() {
    let provider = MockLuks::with(vec![
        ("/dev/sda1", MockDevice::new(HeaderFormat::V2, &[(0, b"different")])),
        ("/dev/sdb1", MockDevice::new(HeaderFormat::V2, &[(0, PASS)])),
    ]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(
        outcome(&report, "/dev/sda1"),
        DeviceOutcome::Failed {
            reason: "credential invalid".into()
        }
    );
    assert_eq!(outcome(&report, "/dev/sdb1"), DeviceOutcome::Added { slot: 31 });
    assert_eq!(report.failed().count(), 1);
    assert_eq!(report.added().count(), 1);
    assert!(report.succeeded());
    assert!(!provider
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Backup { device } if device == "/dev/sda1")));
}

#[test]
fn slot_zero_is_never_removed() {
    let key_in_zero: &[u8] = b"not-the-operator";
    let layouts = vec![
        MockDevice::new(HeaderFormat::V2, &[(0, key_in_zero), (1, PASS)]),
        MockDevice::new(HeaderFormat::V2, &[(0, key_in_zero), (1, PASS)]).with_token(
            3,
            ANNOTATION_TYPE,
            &[0],
        ),
        MockDevice::new(HeaderFormat::V2, &[(0, key_in_zero), (1, PASS), (31, b"x")]).with_token(
            4,
            ANNOTATION_TYPE,
            &[0, 31],
        ),
        MockDevice::new(HeaderFormat::V1, &[(0, key_in_zero), (1, PASS)]),
    ];

    for layout in layouts {
        let provider = MockLuks::with(vec![("/dev/sdx1", layout)]);
        let _ = run(&provider, ProcessOptions::default());
        assert!(!provider
            .calls()
            .iter()
            .any(|c| matches!(c, Call::RemoveSlot { slot: 0, .. })));
        assert!(provider.device("/dev/sdx1").slots.contains_key(&0));
    }
}

#[test]
fn legacy_header_installs_into_first_free_slot() {
    let provider = MockLuks::with(vec![(
        "/dev/sdd1",
        MockDevice::new(HeaderFormat::V1, &[(0, PASS), (1, b"user")]),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(outcome(&report, "/dev/sdd1"), DeviceOutcome::Added { slot: 2 });
    let device = provider.device("/dev/sdd1");
    assert_eq!(device.slots.get(&1).unwrap(), b"user");
    assert!(!provider
        .calls()
        .iter()
        .any(|c| matches!(c, Call::RemoveSlot { .. } | Call::ImportToken { .. })));
}

#[test]
fn legacy_header_with_no_free_slot_aborts() {
    let slots: Vec<(u8, &[u8])> = (0..8u8)
        .map(|s| (s, if s == 0 { PASS } else { b"user".as_slice() }))
        .collect();
    let provider = MockLuks::with(vec![(
        "/dev/sde1",
        MockDevice::new(HeaderFormat::V1, &slots),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(
        outcome(&report, "/dev/sde1"),
        DeviceOutcome::Failed {
            reason: "no free key slot available".into()
        }
    );
    assert!(provider.mutations().is_empty());
}

#[test]
fn install_is_retried_once() {
    let mut device = MockDevice::new(HeaderFormat::V2, &[(0, PASS)]);
    device.add_failures = 1;
    let provider = MockLuks::with(vec![("/dev/sdf1", device)]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(outcome(&report, "/dev/sdf1"), DeviceOutcome::Added { slot: 31 });
    let adds = provider
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::AddKey { .. }))
        .count();
    assert_eq!(adds, 2);
}

#[test]
fn failed_install_after_reclaim_restores_header() {
    let mut device = MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, b"stale")]);
    device.add_failures = 2;
    let provider = MockLuks::with(vec![("/dev/sdg1", device)]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert!(outcome(&report, "/dev/sdg1").is_failed());
    assert!(provider.calls().contains(&Call::Restore {
        device: "/dev/sdg1".into()
    }));
    assert_eq!(provider.device("/dev/sdg1").slots.get(&31).unwrap(), b"stale");
}

#[test]
fn slot_occupied_on_install_is_reported_as_logic_error() {
    let mut device = MockDevice::new(HeaderFormat::V2, &[(0, PASS)]);
    device.add_reports_occupied = true;
    let provider = MockLuks::with(vec![("/dev/sdh1", device)]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    match outcome(&report, "/dev/sdh1") {
        DeviceOutcome::Failed { reason } => assert!(reason.contains("logic error"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    let adds = provider
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::AddKey { .. }))
        .count();
    assert_eq!(adds, 1, "occupied slot is not retried");
}

#[test]
fn dry_run_plans_without_touching_anything() {
    let provider = MockLuks::with(vec![(
        "/dev/sdi1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, b"stale")]),
    )]);

    let (report, packager, _dir) = run(
        &provider,
        ProcessOptions {
            dry_run: true,
            ..ProcessOptions::default()
        },
    );

    assert_eq!(outcome(&report, "/dev/sdi1"), DeviceOutcome::Added { slot: 31 });
    assert!(provider.calls().is_empty());
    assert!(report.archive.is_none());
    assert!(packager.archives.lock().unwrap().is_empty());
    let workflow = report.to_workflow_report();
    assert!(workflow
        .events
        .iter()
        .any(|e| e.message.contains("would remove slot 31")));
}

#[test]
fn headers_only_archives_without_slot_changes() {
    let provider = MockLuks::with(vec![(
        "/dev/sdj1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS)]),
    )]);

    let (report, packager, _dir) = run(
        &provider,
        ProcessOptions {
            headers_only: true,
            ..ProcessOptions::default()
        },
    );

    assert!(matches!(
        outcome(&report, "/dev/sdj1"),
        DeviceOutcome::Skipped { .. }
    ));
    assert!(provider.mutations().is_empty());
    assert_eq!(packager.archives.lock().unwrap().len(), 1);
}

#[test]
fn download_mode_archives_into_download_dir() {
    let dir = tempdir().unwrap();
    let provider = MockLuks::with(vec![(
        "/dev/sdj1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS)]),
    )]);
    let credential = Credential::passphrase("operator-pass");

    let (report, _) = run_with(
        &provider,
        &credential,
        None,
        ProcessOptions {
            download_mode: true,
            ..ProcessOptions::default()
        },
        dir.path(),
    );

    let archive = report.archive.unwrap();
    assert!(archive.starts_with(dir.path().join("downloads")));
    let name = archive.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("luks_headers_") && name.ends_with(".7z"));
}

#[test]
fn annotation_failure_keeps_installed_key() {
    let mut device = MockDevice::new(HeaderFormat::V2, &[(0, PASS)]);
    device.annotation_fails = true;
    let provider = MockLuks::with(vec![("/dev/sdk1", device)]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(outcome(&report, "/dev/sdk1"), DeviceOutcome::Added { slot: 31 });
    let result = &report.results[0];
    assert!(result
        .events
        .iter()
        .any(|e| e.level == WorkflowLevel::Warn && e.message.contains("annotation failed")));
}

#[test]
fn orphaned_annotations_are_removed_before_install() {
    let provider = MockLuks::with(vec![(
        "/dev/sdl1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS)])
            .with_token(5, ANNOTATION_TYPE, &[7])
            .with_token(6, "systemd-tpm2", &[9]),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(outcome(&report, "/dev/sdl1"), DeviceOutcome::Added { slot: 31 });
    let calls = provider.calls();
    assert!(calls.contains(&Call::RemoveToken {
        device: "/dev/sdl1".into(),
        token_id: 5
    }));
    assert!(!calls.contains(&Call::RemoveToken {
        device: "/dev/sdl1".into(),
        token_id: 6
    }));
}

#[test]
fn slot_removal_failure_after_token_cleanup_restores_header() {
    let mut device = MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, b"stale")]).with_token(
        0,
        ANNOTATION_TYPE,
        &[31],
    );
    device.remove_fails = true;
    let provider = MockLuks::with(vec![("/dev/sdn1", device)]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert!(outcome(&report, "/dev/sdn1").is_failed());
    let mutations = provider.mutations();
    assert_eq!(
        mutations,
        vec![
            Call::RemoveToken {
                device: "/dev/sdn1".into(),
                token_id: 0
            },
            Call::RemoveSlot {
                device: "/dev/sdn1".into(),
                slot: 31
            },
            Call::Restore {
                device: "/dev/sdn1".into()
            },
        ]
    );
    let restored = provider.device("/dev/sdn1");
    assert!(restored.tokens.contains_key(&0));
    assert_eq!(restored.slots.get(&31).unwrap(), b"stale");
}

#[test]
fn failed_install_after_token_cleanup_restores_header() {
    let mut device =
        MockDevice::new(HeaderFormat::V2, &[(0, PASS)]).with_token(5, ANNOTATION_TYPE, &[7]);
    device.add_failures = 2;
    let provider = MockLuks::with(vec![("/dev/sdo1", device)]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert!(outcome(&report, "/dev/sdo1").is_failed());
    assert!(provider.calls().contains(&Call::Restore {
        device: "/dev/sdo1".into()
    }));
    assert!(provider.device("/dev/sdo1").tokens.contains_key(&5));
}

#[test]
fn failed_rollback_names_the_install_slot() {
    let mut device = MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, b"stale")]);
    device.add_failures = 2;
    device.restore_fails = true;
    let provider = MockLuks::with(vec![("/dev/sdp1", device)]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    match outcome(&report, "/dev/sdp1") {
        DeviceOutcome::Failed { reason } => {
            assert!(reason.contains("slot 31 failed"), "{reason}");
            assert!(
                reason.contains("rollback failed: provider error: header restore rejected"),
                "{reason}"
            );
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(report.results[0]
        .events
        .iter()
        .any(|e| e.level == WorkflowLevel::Error && e.message.contains("header restore failed")));
}

#[test]
fn stale_hardware_key_outside_reserved_slot_is_removed() {
    let provider = MockLuks::with(vec![(
        "/dev/sdq1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS), (5, b"old-board")]).with_token(
            2,
            ANNOTATION_TYPE,
            &[5],
        ),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(outcome(&report, "/dev/sdq1"), DeviceOutcome::Added { slot: 31 });
    let calls = provider.calls();
    assert!(calls.contains(&Call::RemoveSlot {
        device: "/dev/sdq1".into(),
        slot: 5
    }));
    assert!(calls.contains(&Call::RemoveToken {
        device: "/dev/sdq1".into(),
        token_id: 2
    }));
    let device = provider.device("/dev/sdq1");
    assert!(!device.slots.contains_key(&5));
    assert_eq!(device.slots.get(&31).unwrap(), derived().as_bytes());
}

#[test]
fn annotated_slot_opened_by_credential_is_kept() {
    let provider = MockLuks::with(vec![(
        "/dev/sdr1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS), (5, PASS)]).with_token(
            2,
            ANNOTATION_TYPE,
            &[5],
        ),
    )]);

    let (report, _, _dir) = run(&provider, ProcessOptions::default());

    assert_eq!(outcome(&report, "/dev/sdr1"), DeviceOutcome::Added { slot: 31 });
    assert!(!provider.calls().iter().any(|c| matches!(
        c,
        Call::RemoveSlot { slot: 5, .. } | Call::RemoveToken { token_id: 2, .. }
    )));
    assert_eq!(provider.device("/dev/sdr1").slots.get(&5).unwrap(), PASS);
    assert!(report.results[0]
        .events
        .iter()
        .any(|e| e.message.contains("slot 5: credential opens it; kept")));
}

#[test]
fn headers_only_runs_without_hardware_key() {
    let provider = MockLuks::with(vec![(
        "/dev/sds1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS)]),
    )]);

    let (report, packager, _dir) = run_without_hardware_key(
        &provider,
        ProcessOptions {
            headers_only: true,
            ..ProcessOptions::default()
        },
    );

    assert!(matches!(
        outcome(&report, "/dev/sds1"),
        DeviceOutcome::Skipped { .. }
    ));
    assert!(report.archive.as_ref().is_some_and(|a| a.exists()));
    assert_eq!(packager.archives.lock().unwrap()[0].2, 2);
}

#[test]
fn missing_hardware_key_fails_each_device_after_backup() {
    let provider = MockLuks::with(vec![
        ("/dev/sdt1", MockDevice::new(HeaderFormat::V2, &[(0, PASS)])),
        ("/dev/sdu1", MockDevice::new(HeaderFormat::V1, &[(0, PASS)])),
    ]);

    let (report, _, _dir) = run_without_hardware_key(&provider, ProcessOptions::default());

    for device in ["/dev/sdt1", "/dev/sdu1"] {
        match outcome(&report, device) {
            DeviceOutcome::Failed { reason } => {
                assert!(reason.starts_with("hardware fingerprint unavailable"), "{reason}")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert!(provider.mutations().is_empty());
    assert_eq!(
        provider
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Backup { .. }))
            .count(),
        2
    );
    assert!(report.archive.is_some());
    assert!(!report.succeeded());
}

#[test]
fn keyfile_credential_without_password_reports_archive_failure() {
    let dir = tempdir().unwrap();
    let keyfile = dir.path().join("keyfile");
    fs::write(&keyfile, PASS).unwrap();
    let provider = MockLuks::with(vec![(
        "/dev/sdm1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS)]),
    )]);
    let credential = Credential::keyfile(&keyfile);

    let (report, packager) = run_with(
        &provider,
        &credential,
        None,
        ProcessOptions::default(),
        dir.path(),
    );

    assert_eq!(outcome(&report, "/dev/sdm1"), DeviceOutcome::Added { slot: 31 });
    assert!(report.archive.is_none());
    assert!(report.archive_error.is_some());
    assert!(packager.archives.lock().unwrap().is_empty());
}

#[test]
fn no_devices_is_a_run_error() {
    let dir = tempdir().unwrap();
    let provider = MockLuks::default();
    let fp = fingerprint();
    let key = derived();
    let credential = Credential::passphrase("x");
    let request = ProcessRequest {
        fingerprint: Some(&fp),
        key: Some(&key),
        credential: &credential,
        archive_password: None,
        options: ProcessOptions::default(),
    };
    let err = process_devices(
        &test_config(dir.path()),
        &provider,
        &RecordingPackager::default(),
        &request,
    )
    .unwrap_err();
    assert!(matches!(err, AutoUnlockError::NoEncryptedDevices));
}

#[derive(Clone)]
struct MemoryStore {
    config: Arc<Mutex<AutoUnlockConfig>>,
    saves: Arc<Mutex<usize>>,
    read_only: bool,
}

impl MemoryStore {
    fn new(config: AutoUnlockConfig) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            saves: Arc::new(Mutex::new(0)),
            read_only: false,
        }
    }

    fn read_only(config: AutoUnlockConfig) -> Self {
        Self {
            read_only: true,
            ..Self::new(config)
        }
    }

    fn snapshot(&self) -> AutoUnlockConfig {
        self.config.lock().unwrap().clone()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> AutoUnlockResult<AutoUnlockConfig> {
        Ok(self.snapshot())
    }

    fn save(&self, config: &AutoUnlockConfig) -> AutoUnlockResult<()> {
        if self.read_only {
            return Err(AutoUnlockError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only flash",
            )));
        }
        *self.config.lock().unwrap() = config.clone();
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

struct FixedArray(bool);

impl ArrayProbe for FixedArray {
    type Error = AutoUnlockError;

    fn array_started(&self) -> AutoUnlockResult<bool> {
        Ok(self.0)
    }
}

struct FixedHardware {
    serial: &'static str,
}

impl HardwareProbe for FixedHardware {
    type Error = AutoUnlockError;

    fn board_serial(&self) -> AutoUnlockResult<String> {
        Ok(self.serial.to_string())
    }

    fn default_routes(&self) -> AutoUnlockResult<Vec<DefaultRoute>> {
        Ok(vec![DefaultRoute {
            gateway: "192.168.1.1".into(),
            interface: "br0".into(),
        }])
    }

    fn resolve_gateway_mac(
        &self,
        _route: &DefaultRoute,
        _timeout: Duration,
    ) -> AutoUnlockResult<Option<String>> {
        Ok(Some(MAC.to_string()))
    }
}

fn readiness_of(
    store: &MemoryStore,
    array: bool,
    luks: &MockLuks,
    serial: &'static str,
) -> ReadinessState {
    Readiness {
        store,
        array: &FixedArray(array),
        luks,
        hardware: &FixedHardware { serial },
        probe_timeout: Duration::from_secs(1),
    }
    .evaluate()
    .unwrap()
}

fn provisioned_luks() -> MockLuks {
    let key = derived();
    MockLuks::with(vec![(
        "/dev/md1p1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, key.as_bytes())]),
    )])
}

#[test]
fn readiness_reports_array_stopped_first() {
    let store = MemoryStore::new(AutoUnlockConfig::default());
    assert_eq!(
        readiness_of(&store, false, &provisioned_luks(), SERIAL),
        ReadinessState::ArrayStopped
    );
    assert_eq!(
        readiness_of(&store, false, &MockLuks::default(), "unknown"),
        ReadinessState::ArrayStopped
    );
    assert_eq!(*store.saves.lock().unwrap(), 0);
}

#[test]
fn readiness_persists_no_disk_hint() {
    let store = MemoryStore::new(AutoUnlockConfig::default());
    assert_eq!(
        readiness_of(&store, true, &MockLuks::default(), SERIAL),
        ReadinessState::NoEncryptedDisks
    );
    assert!(!store.snapshot().autounlock.encrypted_disks_available);

    readiness_of(&store, true, &provisioned_luks(), SERIAL);
    assert!(store.snapshot().autounlock.encrypted_disks_available);
}

#[test]
fn readiness_survives_unwritable_disk_hint() {
    let store = MemoryStore::read_only(AutoUnlockConfig::default());
    assert_eq!(
        readiness_of(&store, true, &MockLuks::default(), SERIAL),
        ReadinessState::NoEncryptedDisks
    );
    assert!(store.snapshot().autounlock.encrypted_disks_available);
    assert_eq!(
        readiness_of(&store, true, &provisioned_luks(), SERIAL),
        ReadinessState::ReadyDisabled
    );
}

#[test]
fn readiness_requires_setup_when_key_does_not_unlock() {
    let store = MemoryStore::new(AutoUnlockConfig::default());
    let luks = MockLuks::with(vec![(
        "/dev/md1p1",
        MockDevice::new(HeaderFormat::V2, &[(0, PASS)]),
    )]);
    assert_eq!(
        readiness_of(&store, true, &luks, SERIAL),
        ReadinessState::SetupRequired
    );
    assert_eq!(
        readiness_of(&store, true, &provisioned_luks(), "unknown"),
        ReadinessState::SetupRequired
    );
}

#[test]
fn readiness_splits_on_enabled_flag() {
    let store = MemoryStore::new(AutoUnlockConfig::default());
    let luks = provisioned_luks();
    assert_eq!(
        readiness_of(&store, true, &luks, SERIAL),
        ReadinessState::ReadyDisabled
    );
    store.update(|cfg| cfg.autounlock.enabled = true).unwrap();
    assert_eq!(
        readiness_of(&store, true, &luks, SERIAL),
        ReadinessState::ReadyEnabled
    );
    assert_eq!(ReadinessState::ReadyEnabled.as_str(), "ready_enabled");
}

#[test]
fn auxiliary_queries_count_keys() {
    let store = MemoryStore::new(AutoUnlockConfig::default());
    let key = derived();
    let luks = MockLuks::with(vec![
        (
            "/dev/md1p1",
            MockDevice::new(HeaderFormat::V2, &[(0, PASS), (31, key.as_bytes())]).with_token(
                0,
                ANNOTATION_TYPE,
                &[31],
            ),
        ),
        ("/dev/md2p1", MockDevice::new(HeaderFormat::V2, &[(0, PASS)])),
    ]);
    let readiness = Readiness {
        store: &store,
        array: &FixedArray(true),
        luks: &luks,
        hardware: &FixedHardware { serial: SERIAL },
        probe_timeout: Duration::from_secs(1),
    };
    assert_eq!(readiness.unlockable_count().unwrap(), 1);
    assert_eq!(readiness.keys_exist().unwrap(), 1);
    assert!(readiness.keys_work().unwrap());
}

fn controller_fixture() -> (tempfile::TempDir, MemoryStore) {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let hooks = dir.path().join("hooks");
    fs::create_dir_all(&hooks).unwrap();
    fs::write(hooks.join("fetch_key"), "#!/bin/sh\nautounlock fetch-key\n").unwrap();
    fs::write(hooks.join("delete_key"), "#!/bin/sh\nautounlock clear-key\n").unwrap();
    (dir, MemoryStore::new(config))
}

#[test]
fn enable_installs_hooks_idempotently() {
    let (dir, store) = controller_fixture();
    let controller = Controller::new(&store);

    controller.enable().unwrap();
    controller.enable().unwrap();

    let fetch = dir.path().join("event/starting/fetch_key");
    let delete = dir.path().join("event/started/delete_key");
    assert!(fetch.is_file());
    assert!(delete.is_file());
    assert!(store.snapshot().autounlock.enabled);
    let status = controller.hook_status().unwrap();
    assert!(status.installed());
    assert!(status.consistency().is_ok());
}

#[test]
fn disable_after_enable_removes_everything() {
    let (dir, store) = controller_fixture();
    let controller = Controller::new(&store);

    controller.enable().unwrap();
    controller.disable().unwrap();

    assert!(!dir.path().join("event/starting/fetch_key").exists());
    assert!(!dir.path().join("event/started/delete_key").exists());
    assert!(!store.snapshot().autounlock.enabled);

    let report = controller.disable().unwrap();
    assert!(!report.has_errors());
}

#[test]
fn hook_mismatch_is_reported_not_corrected() {
    let (dir, store) = controller_fixture();
    let controller = Controller::new(&store);
    controller.enable().unwrap();
    fs::remove_file(dir.path().join("event/started/delete_key")).unwrap();

    let status = controller.hook_status().unwrap();
    assert_eq!(status.as_str(), "partial");
    assert!(matches!(
        status.consistency(),
        Err(AutoUnlockError::ConfigInconsistent(_))
    ));
    assert!(store.snapshot().autounlock.enabled);
    assert!(dir.path().join("event/starting/fetch_key").exists());
}
