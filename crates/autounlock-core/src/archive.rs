//! Password-protected packaging of header backups and the metadata report.

use crate::config::{resolve_binary, AutoUnlockConfig, KNOWN_ARCHIVER_PATHS};
use crate::credential::Credential;
use crate::error::{AutoUnlockError, AutoUnlockResult};
use crate::fingerprint::{DerivedKey, HardwareFingerprint};
use crate::inspector::DeviceSlotAnalysis;
use crate::process::ExternalCommand;
use chrono::{DateTime, Local};
use log::{info, warn};
use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Report file name inside the archive.
pub const REPORT_FILE_NAME: &str = "luks_metadata_report.txt";

/// Marker line callers watch for once the archive exists.
pub const ARCHIVE_READY_MARKER: &str = "ARCHIVE_READY:";

/// Something that can write an encrypted container.
pub trait ArchivePackager {
    /// Package `files` into `archive`, encrypting contents and names with
    /// `password`.
    fn package(&self, archive: &Path, password: &str, files: &[PathBuf]) -> AutoUnlockResult<()>;
}

/// `7z` with header encryption.
#[derive(Debug, Clone)]
pub struct SevenZipPackager {
    command: ExternalCommand,
}

impl SevenZipPackager {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            command: ExternalCommand::new(binary),
        }
    }

    pub fn from_config(config: &AutoUnlockConfig) -> AutoUnlockResult<Self> {
        let binary = resolve_binary(
            config.paths.archiver_path.as_deref(),
            KNOWN_ARCHIVER_PATHS,
            "7z",
        )?;
        Ok(Self::new(binary))
    }
}

impl ArchivePackager for SevenZipPackager {
    fn package(&self, archive: &Path, password: &str, files: &[PathBuf]) -> AutoUnlockResult<()> {
        let password_arg = Zeroizing::new(format!("-p{password}"));
        let mut args: Vec<OsString> = vec![
            "a".into(),
            "-t7z".into(),
            "-mhe=on".into(),
            "-y".into(),
            password_arg.as_str().into(),
            archive.as_os_str().to_os_string(),
        ];
        args.extend(files.iter().map(|f| f.as_os_str().to_os_string()));

        let output = self.command.run(&args, None)?;
        if !output.success() {
            return Err(AutoUnlockError::ArchiveFailed(format!(
                "7z exited with status {}: {}",
                output.status,
                output.diagnostic()
            )));
        }
        Ok(())
    }
}

/// Password protecting the archive.
///
/// Passphrase credentials double as the password; keyfile credentials need an
/// explicit one.
pub fn archive_password<'a>(
    credential: &'a Credential,
    explicit: Option<&'a str>,
) -> AutoUnlockResult<&'a str> {
    if let Some(password) = explicit.filter(|p| !p.is_empty()) {
        return Ok(password);
    }
    match credential {
        Credential::Passphrase(passphrase) if !passphrase.is_empty() => Ok(passphrase.as_str()),
        Credential::Passphrase(_) => Err(AutoUnlockError::ArchiveFailed(
            "empty passphrase cannot protect the archive".into(),
        )),
        Credential::Keyfile(_) => Err(AutoUnlockError::ArchiveFailed(
            "keyfile authentication requires an explicit archive password".into(),
        )),
    }
}

/// `<dir>/luks_headers_<YYYYMMDD_HHMMSS>.7z`
pub fn archive_path(dir: &Path, now: &DateTime<Local>) -> PathBuf {
    dir.join(format!("luks_headers_{}.7z", now.format("%Y%m%d_%H%M%S")))
}

/// Plain-text report shipped next to the header backups.
///
/// Contains the derived key, so it only ever exists inside the run's private
/// working directory and the encrypted archive.
pub fn render_report(
    fingerprint: Option<&HardwareFingerprint>,
    key: Option<&DerivedKey>,
    analyses: &[DeviceSlotAnalysis],
    now: &DateTime<Local>,
) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::new());
    let _ = writeln!(out, "LUKS header backup report");
    let _ = writeln!(out, "Generated: {}", now.to_rfc3339());
    let _ = writeln!(out);
    let _ = writeln!(out, "Hardware fingerprint");
    match (fingerprint, key) {
        (Some(fingerprint), Some(key)) => {
            let _ = writeln!(out, "  Motherboard serial: {}", fingerprint.board_serial());
            let _ = writeln!(out, "  Gateway MAC: {}", fingerprint.gateway_mac());
            let _ = writeln!(out, "  Derived key: {}", key.as_str());
        }
        _ => {
            let _ = writeln!(out, "  Unavailable: hardware identifiers could not be read");
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Devices ({})", analyses.len());
    for analysis in analyses {
        out.push_str(&analysis.render());
    }
    out
}

/// Write the report into `workdir` and package it with `backups` under
/// `dest_dir`. Returns the archive path.
pub fn build_archive<A>(
    packager: &A,
    dest_dir: &Path,
    workdir: &Path,
    password: &str,
    backups: &[PathBuf],
    report: &str,
    now: &DateTime<Local>,
) -> AutoUnlockResult<PathBuf>
where
    A: ArchivePackager,
{
    if backups.is_empty() {
        return Err(AutoUnlockError::ArchiveFailed(
            "no header backups to archive".into(),
        ));
    }

    fs::create_dir_all(dest_dir).map_err(|err| {
        AutoUnlockError::ArchiveFailed(format!("create {}: {err}", dest_dir.display()))
    })?;

    let report_path = workdir.join(REPORT_FILE_NAME);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&report_path)
        .map_err(|err| AutoUnlockError::ArchiveFailed(format!("write report: {err}")))?;
    file.write_all(report.as_bytes())
        .map_err(|err| AutoUnlockError::ArchiveFailed(format!("write report: {err}")))?;
    drop(file);

    let archive = archive_path(dest_dir, now);
    if archive.exists() {
        warn!("replacing existing archive {}", archive.display());
        fs::remove_file(&archive)?;
    }

    let mut files = backups.to_vec();
    files.push(report_path);
    packager.package(&archive, password, &files)?;

    if !archive.exists() {
        return Err(AutoUnlockError::ArchiveFailed(format!(
            "archiver reported success but {} is missing",
            archive.display()
        )));
    }
    info!("archived {} header backup(s) to {}", backups.len(), archive.display());
    Ok(archive)
}
