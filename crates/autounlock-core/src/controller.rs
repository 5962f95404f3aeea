//! Enable/disable of boot-time auto-unlock through event hook files.
//!
//! The hooks' presence under the platform event directories is what the boot
//! sequence acts on; the persisted `enabled` flag records operator intent.

use crate::config::{AutoUnlockConfig, ConfigStore};
use crate::error::{AutoUnlockError, AutoUnlockResult};
use crate::workflow::{WorkflowLevel, WorkflowReport};
use log::{info, warn};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Hook that stages the derived key before the array starts.
pub const FETCH_HOOK: &str = "fetch_key";
/// Hook that erases the staged key once the array has started.
pub const DELETE_HOOK: &str = "delete_key";

const STARTING_EVENT: &str = "starting";
const STARTED_EVENT: &str = "started";

/// Hook presence next to the persisted flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookStatus {
    pub enabled: bool,
    pub fetch_installed: bool,
    pub delete_installed: bool,
}

impl HookStatus {
    pub fn installed(&self) -> bool {
        self.fetch_installed && self.delete_installed
    }

    pub fn absent(&self) -> bool {
        !self.fetch_installed && !self.delete_installed
    }

    /// Token for the hook query: `installed`, `missing`, or `partial`.
    pub fn as_str(&self) -> &'static str {
        if self.installed() {
            "installed"
        } else if self.absent() {
            "missing"
        } else {
            "partial"
        }
    }

    /// `ConfigInconsistent` when the flag and the hook files disagree.
    pub fn consistency(&self) -> Result<(), AutoUnlockError> {
        let consistent = if self.enabled {
            self.installed()
        } else {
            self.absent()
        };
        if consistent {
            Ok(())
        } else {
            Err(AutoUnlockError::ConfigInconsistent(format!(
                "enabled={} but hooks are {}",
                self.enabled,
                self.as_str()
            )))
        }
    }
}

/// Where a hook is copied from and to.
struct HookPlacement {
    name: &'static str,
    source: PathBuf,
    target: PathBuf,
}

fn placements(config: &AutoUnlockConfig) -> [HookPlacement; 2] {
    let source = config.hook_source_dir();
    let events = config.events_root();
    [
        HookPlacement {
            name: FETCH_HOOK,
            source: source.join(FETCH_HOOK),
            target: events.join(STARTING_EVENT).join(FETCH_HOOK),
        },
        HookPlacement {
            name: DELETE_HOOK,
            source: source.join(DELETE_HOOK),
            target: events.join(STARTED_EVENT).join(DELETE_HOOK),
        },
    ]
}

/// Toggles auto-unlock; both directions are idempotent.
pub struct Controller<'a, S> {
    store: &'a S,
}

impl<'a, S: ConfigStore> Controller<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Persist `enabled = true` and install both hooks.
    pub fn enable(&self) -> AutoUnlockResult<WorkflowReport> {
        let config = self.store.load()?;
        let hooks = placements(&config);
        for hook in &hooks {
            if !hook.source.is_file() {
                return Err(AutoUnlockError::InvalidConfig(format!(
                    "hook source {} is missing",
                    hook.source.display()
                )));
            }
        }

        self.store.update(|cfg| cfg.autounlock.enabled = true)?;
        let mut report = WorkflowReport::new("Enable auto-unlock");
        report.push(WorkflowLevel::Info, "Persisted enabled = true");

        for hook in &hooks {
            if let Some(parent) = hook.target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&hook.source, &hook.target)?;
            fs::set_permissions(&hook.target, fs::Permissions::from_mode(0o755))?;
            info!("installed {} hook at {}", hook.name, hook.target.display());
            report.push(
                WorkflowLevel::Success,
                format!("Installed {} hook at {}", hook.name, hook.target.display()),
            );
        }
        Ok(report)
    }

    /// Persist `enabled = false` and remove both hooks; absent hooks are fine.
    pub fn disable(&self) -> AutoUnlockResult<WorkflowReport> {
        let config = self.store.update(|cfg| cfg.autounlock.enabled = false)?;
        let mut report = WorkflowReport::new("Disable auto-unlock");
        report.push(WorkflowLevel::Info, "Persisted enabled = false");

        for hook in &placements(&config) {
            match fs::remove_file(&hook.target) {
                Ok(()) => {
                    info!("removed {} hook from {}", hook.name, hook.target.display());
                    report.push(
                        WorkflowLevel::Success,
                        format!("Removed {} hook", hook.name),
                    );
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    report.push(
                        WorkflowLevel::Info,
                        format!("{} hook already absent", hook.name),
                    );
                }
                Err(err) => return Err(AutoUnlockError::Io(err)),
            }
        }
        Ok(report)
    }

    /// Current hook presence; a mismatch with the flag is only logged.
    pub fn hook_status(&self) -> AutoUnlockResult<HookStatus> {
        let config = self.store.load()?;
        let [fetch, delete] = placements(&config);
        let status = HookStatus {
            enabled: config.autounlock.enabled,
            fetch_installed: fetch.target.is_file(),
            delete_installed: delete.target.is_file(),
        };
        if let Err(err) = status.consistency() {
            warn!("{err}");
        }
        Ok(status)
    }
}
