//! Staging and erasure of the boot keyfile consumed by array start.

use crate::error::{AutoUnlockError, AutoUnlockResult};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{fchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Write key material to `path` atomically with mode 0400.
///
/// Existing ownership is preserved when the file is replaced.
pub fn write_key_file(path: &Path, key: &[u8]) -> AutoUnlockResult<()> {
    if key.is_empty() {
        return Err(AutoUnlockError::InvalidKey {
            path: path.to_path_buf(),
            reason: "refusing to stage empty key material".into(),
        });
    }

    let dest = resolve_write_path(path)?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let ownership = fs::metadata(&dest)
        .ok()
        .map(|meta| (meta.uid(), meta.gid()));

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(key)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o400))?;

    if let Some((uid, gid)) = ownership {
        fchown(temp.as_file(), Some(uid), Some(gid))?;
    }

    let _ = temp.as_file().sync_all();
    temp.persist(&dest)
        .map_err(|err| AutoUnlockError::Io(err.error))?;
    let _ = sync_parent_dir(parent);
    Ok(())
}

/// Overwrite the staged keyfile with zeros and unlink it.
///
/// Returns `Ok(false)` when nothing was staged.
pub fn clear_key_file(path: &Path) -> AutoUnlockResult<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(AutoUnlockError::Io(err)),
    };

    if meta.is_file() && meta.len() > 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        let mut file = OpenOptions::new().write(true).open(path)?;
        let len = usize::try_from(meta.len()).unwrap_or(usize::MAX);
        file.write_all(&vec![0u8; len])?;
        let _ = file.sync_all();
    }

    fs::remove_file(path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let _ = sync_parent_dir(parent);
    }
    Ok(true)
}

fn resolve_write_path(path: &Path) -> AutoUnlockResult<PathBuf> {
    let mut candidate = path.to_path_buf();
    for _ in 0..16 {
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(AutoUnlockError::Io(err)),
        };

        if !meta.file_type().is_symlink() {
            return Ok(candidate);
        }

        let target = fs::read_link(&candidate)?;
        candidate = if target.is_absolute() {
            target
        } else {
            candidate
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(target)
        };
    }

    Err(AutoUnlockError::InvalidKey {
        path: path.to_path_buf(),
        reason: "symlink resolution depth exceeded".into(),
    })
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_key_file_sets_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyfile");
        write_key_file(&path, b"abc123").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abc123");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }

    #[test]
    fn write_key_file_creates_parent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("keyfile");
        write_key_file(&nested, b"k").unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn write_key_file_replaces_existing_read_only_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyfile");
        write_key_file(&path, b"first").unwrap();
        write_key_file(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn write_key_file_rejects_empty_key() {
        let dir = tempdir().unwrap();
        let err = write_key_file(&dir.path().join("keyfile"), b"").unwrap_err();
        assert!(matches!(err, AutoUnlockError::InvalidKey { .. }));
    }

    #[test]
    fn clear_key_file_removes_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyfile");
        write_key_file(&path, b"secret").unwrap();
        assert!(clear_key_file(&path).unwrap());
        assert!(!path.exists());
        assert!(!clear_key_file(&path).unwrap());
    }
}
