//! Operator-supplied credential for the original key slot.

use autounlock_provider::luks::KeyMaterial;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// The credential the operator authenticated with for a processing run.
#[derive(Clone)]
pub enum Credential {
    Passphrase(Zeroizing<String>),
    Keyfile(PathBuf),
}

impl Credential {
    pub fn passphrase(value: impl Into<String>) -> Self {
        Credential::Passphrase(Zeroizing::new(value.into()))
    }

    pub fn keyfile(path: impl AsRef<Path>) -> Self {
        Credential::Keyfile(path.as_ref().to_path_buf())
    }

    pub fn key_material(&self) -> KeyMaterial<'_> {
        match self {
            Credential::Passphrase(value) => KeyMaterial::Bytes(value.as_bytes()),
            Credential::Keyfile(path) => KeyMaterial::File(path),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Passphrase(_) => "passphrase",
            Credential::Keyfile(_) => "keyfile",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Passphrase(_) => f.write_str("Credential::Passphrase(<redacted>)"),
            Credential::Keyfile(path) => write!(f, "Credential::Keyfile({})", path.display()),
        }
    }
}
