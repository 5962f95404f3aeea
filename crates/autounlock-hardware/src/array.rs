//! Array state from the `var.ini` key/value file.

use autounlock_core::error::{AutoUnlockError, AutoUnlockResult};
use autounlock_core::AutoUnlockConfig;
use autounlock_provider::host::ArrayProbe;
use std::fs;
use std::path::PathBuf;

const STATE_KEY: &str = "mdState";
const STARTED: &str = "STARTED";

/// Reads `mdState="..."` from the host state file.
#[derive(Debug, Clone)]
pub struct VarIniArrayProbe {
    path: PathBuf,
}

impl VarIniArrayProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &AutoUnlockConfig) -> Self {
        Self::new(&config.paths.array_state_file)
    }
}

impl ArrayProbe for VarIniArrayProbe {
    type Error = AutoUnlockError;

    fn array_started(&self) -> AutoUnlockResult<bool> {
        let contents = fs::read_to_string(&self.path).map_err(|err| {
            AutoUnlockError::Provider(format!("read {}: {err}", self.path.display()))
        })?;
        Ok(parse_md_state(&contents).as_deref() == Some(STARTED))
    }
}

fn parse_md_state(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == STATE_KEY).then(|| value.trim().trim_matches('"').to_string())
    })
}
