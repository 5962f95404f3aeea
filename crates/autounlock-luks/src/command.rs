//! Execution wrapper for invoking `cryptsetup`.
//!
//! The goal is to keep shell integration isolated so provider logic stays
//! testable (fake binaries, deterministic stdout parsing).

use autounlock_core::error::{AutoUnlockError, AutoUnlockResult};
use autounlock_core::process::{CommandOutput, ExternalCommand};
use autounlock_provider::luks::KeyMaterial;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Exit code `cryptsetup open` uses for a key that matches no slot.
const EXIT_KEY_REJECTED: i32 = 2;

#[derive(Debug, Clone)]
pub(crate) struct CryptsetupCommand {
    command: ExternalCommand,
}

impl CryptsetupCommand {
    pub(crate) fn new(binary: PathBuf) -> Self {
        Self {
            command: ExternalCommand::new(binary),
        }
    }

    pub(crate) fn is_luks(&self, device: &str) -> AutoUnlockResult<bool> {
        let out = self.command.run(&["isLuks", device], None)?;
        Ok(out.success())
    }

    /// `open --test-passphrase`. Only a rejected key (exit code 2) is
    /// `Ok(false)`; every other failure is an error.
    pub(crate) fn test_key(
        &self,
        device: &str,
        key: KeyMaterial<'_>,
        slot: Option<u8>,
    ) -> AutoUnlockResult<bool> {
        let (key_arg, input) = key_source(key);
        let mut args = vec![
            "open".to_string(),
            "--test-passphrase".to_string(),
            "--batch-mode".to_string(),
        ];
        if let Some(slot) = slot {
            args.push("--key-slot".to_string());
            args.push(slot.to_string());
        }
        args.push("--key-file".to_string());
        args.push(key_arg);
        args.push(device.to_string());

        let out = self.command.run(&args, input)?;
        if out.success() {
            return Ok(true);
        }

        if out.status == EXIT_KEY_REJECTED {
            return Ok(false);
        }
        Err(AutoUnlockError::Provider(format!(
            "{} (exit code {})",
            classify_open_failure(device, slot, &out.diagnostic()),
            out.status
        )))
    }

    /// `luksAddKey`, authorised by `existing`; the new key is handed over via a
    /// private temporary file so stdin stays free for the existing key.
    pub(crate) fn add_key(
        &self,
        device: &str,
        existing: KeyMaterial<'_>,
        new_key: &[u8],
        slot: Option<u8>,
    ) -> AutoUnlockResult<()> {
        let new_key_file = private_key_file(new_key)?;
        let (key_arg, input) = key_source(existing);

        let mut args = vec!["luksAddKey".to_string(), "--batch-mode".to_string()];
        if let Some(slot) = slot {
            args.push("--key-slot".to_string());
            args.push(slot.to_string());
        }
        args.push("--key-file".to_string());
        args.push(key_arg);
        args.push(device.to_string());
        args.push(new_key_file.path().to_string_lossy().into_owned());

        let out = self.command.run(&args, input)?;
        if out.success() {
            return Ok(());
        }

        let diagnostic = out.diagnostic();
        let target = slot.unwrap_or(u8::MAX);
        if let Some(slot) = slot.filter(|_| slot_full(&diagnostic)) {
            return Err(AutoUnlockError::SlotOccupied {
                device: device.to_string(),
                slot,
            });
        }
        Err(AutoUnlockError::SlotOperationFailed {
            device: device.to_string(),
            slot: target,
            reason: format!(
                "{} (exit code {})",
                classify_addkey_failure(device, &diagnostic),
                out.status
            ),
        })
    }

    pub(crate) fn kill_slot(
        &self,
        device: &str,
        slot: u8,
        authorizing: KeyMaterial<'_>,
    ) -> AutoUnlockResult<()> {
        let (key_arg, input) = key_source(authorizing);
        let slot_arg = slot.to_string();
        let args = [
            "luksKillSlot",
            "--batch-mode",
            "--key-file",
            key_arg.as_str(),
            device,
            slot_arg.as_str(),
        ];
        let out = self.command.run(&args, input)?;
        if out.success() {
            return Ok(());
        }
        Err(AutoUnlockError::SlotOperationFailed {
            device: device.to_string(),
            slot,
            reason: format!(
                "{} (exit code {})",
                classify_slot_failure("remove", device, &out.diagnostic()),
                out.status
            ),
        })
    }

    pub(crate) fn header_backup(&self, device: &str, destination: &Path) -> AutoUnlockResult<()> {
        let dest = destination.to_string_lossy();
        let out = self.command.run(
            &[
                "luksHeaderBackup",
                "--batch-mode",
                device,
                "--header-backup-file",
                &*dest,
            ],
            None,
        )?;
        expect_success(out, || format!("luksHeaderBackup of {device} failed"))
    }

    pub(crate) fn header_restore(&self, device: &str, source: &Path) -> AutoUnlockResult<()> {
        let src = source.to_string_lossy();
        let out = self.command.run(
            &[
                "luksHeaderRestore",
                "--batch-mode",
                device,
                "--header-backup-file",
                &*src,
            ],
            None,
        )?;
        expect_success(out, || format!("luksHeaderRestore of {device} failed"))
    }

    pub(crate) fn dump(&self, device: &str) -> AutoUnlockResult<String> {
        let out = self.command.run(&["luksDump", device], None)?;
        expect_stdout(out, || format!("luksDump of {device} failed"))
    }

    pub(crate) fn dump_json(&self, device: &str) -> AutoUnlockResult<String> {
        let out = self
            .command
            .run(&["luksDump", "--dump-json-metadata", device], None)?;
        expect_stdout(out, || format!("luksDump --dump-json-metadata of {device} failed"))
    }

    pub(crate) fn uuid(&self, device: &str) -> AutoUnlockResult<String> {
        let out = self.command.run(&["luksUUID", device], None)?;
        let uuid = expect_stdout(out, || format!("luksUUID of {device} failed"))?;
        let uuid = uuid.trim().to_string();
        if uuid.is_empty() {
            return Err(AutoUnlockError::Provider(format!(
                "luksUUID of {device} returned nothing"
            )));
        }
        Ok(uuid)
    }

    pub(crate) fn token_import(&self, device: &str, token_json: &str) -> AutoUnlockResult<()> {
        let out = self.command.run(
            &["token", "import", "--json-file", "-", device],
            Some(token_json.as_bytes()),
        )?;
        expect_success(out, || format!("token import on {device} failed"))
    }

    pub(crate) fn token_remove(&self, device: &str, token_id: u32) -> AutoUnlockResult<()> {
        let id = token_id.to_string();
        let out = self
            .command
            .run(&["token", "remove", "--token-id", id.as_str(), device], None)?;
        expect_success(out, || format!("token remove {token_id} on {device} failed"))
    }
}

fn key_source(key: KeyMaterial<'_>) -> (String, Option<&[u8]>) {
    match key {
        KeyMaterial::Bytes(bytes) => ("-".to_string(), Some(bytes)),
        KeyMaterial::File(path) => (path.to_string_lossy().into_owned(), None),
    }
}

fn private_key_file(key: &[u8]) -> AutoUnlockResult<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))?;
    file.as_file_mut().write_all(key)?;
    file.as_file_mut().flush()?;
    Ok(file)
}

fn expect_success<F>(out: CommandOutput, context: F) -> AutoUnlockResult<()>
where
    F: FnOnce() -> String,
{
    if out.success() {
        return Ok(());
    }
    Err(AutoUnlockError::Provider(format!(
        "{}: {} (exit code {})",
        context(),
        describe(&out.diagnostic()),
        out.status
    )))
}

fn expect_stdout<F>(out: CommandOutput, context: F) -> AutoUnlockResult<String>
where
    F: FnOnce() -> String,
{
    if out.success() {
        return Ok(out.stdout);
    }
    Err(AutoUnlockError::Provider(format!(
        "{}: {} (exit code {})",
        context(),
        describe(&out.diagnostic()),
        out.status
    )))
}

fn describe(diagnostic: &str) -> String {
    let trimmed = diagnostic.trim();
    if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    }
}

fn slot_full(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    (lower.contains("slot") && (lower.contains("is full") || lower.contains("already in use")))
        || lower.contains("not free")
}

fn classify_open_failure(device: &str, slot: Option<u8>, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);
    let target = match slot {
        Some(slot) => format!("slot {slot} of `{device}`"),
        None => format!("`{device}`"),
    };

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "cryptsetup could not test a key against {target}: {diagnostic}. This usually requires elevated privileges (run as root)"
        );
    }

    if lower.contains("not a valid luks device") || lower.contains("is not a luks device") {
        return format!("cryptsetup reports `{device}` is not a LUKS device: {diagnostic}");
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("cannot open device")
    {
        return format!(
            "cryptsetup could not access `{device}` while testing {target}: {diagnostic}. Confirm the device is present"
        );
    }

    format!("cryptsetup failed to test a key against {target}: {diagnostic}")
}

fn classify_addkey_failure(device: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        return format!(
            "cryptsetup rejected the supplied credential while adding a key to `{device}`: {diagnostic}"
        );
    }

    if lower.contains("no remaining keyslot")
        || lower.contains("no free key slot")
        || lower.contains("no free keyslot")
        || lower.contains("all key slots full")
    {
        return format!(
            "cryptsetup could not add a key because `{device}` has no free keyslots: {diagnostic}"
        );
    }

    classify_slot_failure("add a key to", device, &diagnostic)
}

fn classify_slot_failure(action: &str, device: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "cryptsetup could not {action} `{device}`: {diagnostic}. This usually requires elevated privileges (run as root)"
        );
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("cannot open device")
    {
        return format!(
            "cryptsetup could not access `{device}` to {action} it: {diagnostic}. Confirm the device is present"
        );
    }

    format!("cryptsetup failed to {action} `{device}`: {diagnostic}")
}
