//! Configuration model, on-disk persistence, and the injectable config store.

use crate::error::{AutoUnlockError, AutoUnlockResult};
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/boot/config/plugins/autounlock/autounlock.toml";
const KEYFILE_PATH_ENV: &str = "AUTOUNLOCK_KEYFILE";
const BOOTSTRAP_FILE_NAME: &str = "autounlock.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "AutoUnlock";
const APP_NAME: &str = "autounlock";

pub const KNOWN_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
pub const KNOWN_LSBLK_PATHS: &[&str] = &["/bin/lsblk", "/usr/bin/lsblk"];
pub const KNOWN_ARCHIVER_PATHS: &[&str] = &["/usr/bin/7z", "/usr/local/bin/7z", "/usr/bin/7za"];
pub const KNOWN_IP_PATHS: &[&str] = &["/sbin/ip", "/usr/sbin/ip", "/bin/ip", "/usr/bin/ip"];
pub const KNOWN_ARPING_PATHS: &[&str] = &["/usr/sbin/arping", "/sbin/arping", "/usr/bin/arping"];
pub const KNOWN_DMIDECODE_PATHS: &[&str] = &["/usr/sbin/dmidecode", "/sbin/dmidecode"];

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// First candidate that exists on this host.
pub fn detect_binary_path(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

/// Resolve an external tool: explicit override, then known locations, then `PATH`.
pub fn resolve_binary(
    configured: Option<&str>,
    candidates: &[&str],
    name: &str,
) -> AutoUnlockResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(AutoUnlockError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    if let Some(found) = detect_binary_path(candidates) {
        return Ok(found);
    }

    find_in_path(name).ok_or_else(|| {
        AutoUnlockError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {candidates:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}

/// Persisted auto-unlock switch and the cached encrypted-disk hint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AutoUnlockCfg {
    #[serde(default)]
    pub enabled: bool,

    /// Last enumeration result, written by readiness checks for the web
    /// layer. Advisory only.
    #[serde(default = "default_true")]
    pub encrypted_disks_available: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AutoUnlockCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            encrypted_disks_available: true,
        }
    }
}

/// Locations of external tools, hook assets, and output directories.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PathsCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub lsblk_path: Option<String>,

    #[serde(default)]
    pub archiver_path: Option<String>,

    #[serde(default)]
    pub ip_path: Option<String>,

    #[serde(default)]
    pub arping_path: Option<String>,

    #[serde(default)]
    pub dmidecode_path: Option<String>,

    /// Directory holding the pristine `fetch_key` / `delete_key` hook scripts.
    #[serde(default = "default_hook_source_dir")]
    pub hook_source_dir: String,

    /// Root of the platform event tree (`starting/`, `started/` live below it).
    #[serde(default = "default_events_root")]
    pub events_root: String,

    /// Keyfile consumed by the array start sequence.
    #[serde(default = "default_keyfile_path")]
    pub keyfile_path: String,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,

    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Key/value state file exposing `mdState`.
    #[serde(default = "default_array_state_file")]
    pub array_state_file: String,
}

fn default_hook_source_dir() -> String {
    "/usr/local/share/autounlock/hooks".to_string()
}

fn default_events_root() -> String {
    "/usr/local/emhttp/webGui/event".to_string()
}

fn default_keyfile_path() -> String {
    "/root/keyfile".to_string()
}

fn default_backup_dir() -> String {
    "/boot/config/plugins/autounlock/backups".to_string()
}

fn default_download_dir() -> String {
    "/tmp/autounlock/downloads".to_string()
}

fn default_array_state_file() -> String {
    "/var/local/emhttp/var.ini".to_string()
}

impl Default for PathsCfg {
    fn default() -> Self {
        Self {
            cryptsetup_path: None,
            lsblk_path: None,
            archiver_path: None,
            ip_path: None,
            arping_path: None,
            dmidecode_path: None,
            hook_source_dir: default_hook_source_dir(),
            events_root: default_events_root(),
            keyfile_path: default_keyfile_path(),
            backup_dir: default_backup_dir(),
            download_dir: default_download_dir(),
            array_state_file: default_array_state_file(),
        }
    }
}

/// Hardware probe tuning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HardwareCfg {
    #[serde(default = "default_serial_path")]
    pub serial_path: String,

    /// Per-route bound for resolving the gateway MAC.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_serial_path() -> String {
    "/sys/class/dmi/id/board_serial".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    2
}

impl Default for HardwareCfg {
    fn default() -> Self {
        Self {
            serial_path: default_serial_path(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Retry budget for slot installation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryCfg {
    #[serde(default = "default_install_attempts")]
    pub install_attempts: u32,
}

fn default_install_attempts() -> u32 {
    2
}

impl Default for RetryCfg {
    fn default() -> Self {
        Self {
            install_attempts: default_install_attempts(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AutoUnlockConfig {
    #[serde(default)]
    pub autounlock: AutoUnlockCfg,

    #[serde(default)]
    pub paths: PathsCfg,

    #[serde(default)]
    pub hardware: HardwareCfg,

    #[serde(default)]
    pub retry: RetryCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Toml,
        }
    }
}

pub fn bootstrap_template() -> String {
    "# Auto-generated auto-unlock configuration.\n\
     # `enabled` is managed by `autounlock enable` / `autounlock disable`.\n\n\
     [autounlock]\n\
     enabled = false\n\
     encrypted_disks_available = true\n\n\
     [paths]\n\
     # Leave tool paths unset to autodetect.\n\
     # cryptsetup_path = \"/usr/sbin/cryptsetup\"\n\
     hook_source_dir = \"/usr/local/share/autounlock/hooks\"\n\
     events_root = \"/usr/local/emhttp/webGui/event\"\n\
     keyfile_path = \"/root/keyfile\"\n\
     backup_dir = \"/boot/config/plugins/autounlock/backups\"\n\
     download_dir = \"/tmp/autounlock/downloads\"\n\
     array_state_file = \"/var/local/emhttp/var.ini\"\n\n\
     [hardware]\n\
     serial_path = \"/sys/class/dmi/id/board_serial\"\n\
     probe_timeout_secs = 2\n\n\
     [retry]\n\
     install_attempts = 2\n"
        .to_string()
}

impl AutoUnlockConfig {
    /// Return the canonical configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used when the system path is not writable.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Defaults bound to `path`, without touching disk.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            format: ConfigFormat::from_path(&path),
            path,
            ..Self::default()
        }
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// When the caller requests the default path and the process cannot
    /// create it, a per-user configuration is written to the platform config
    /// directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> AutoUnlockResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("auto-unlock config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(AutoUnlockError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    AutoUnlockError::InvalidConfig(format!(
                        "unable to determine user configuration directory; create {DEFAULT_CONFIG_PATH} manually"
                    ))
                })?;

                ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    AutoUnlockError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detecting the format from its extension.
    pub fn load<P: AsRef<Path>>(path: P) -> AutoUnlockResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let format = ConfigFormat::from_path(path);
        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(&contents)?,
        };
        cfg.path = path.to_path_buf();
        cfg.format = format;

        if cfg.retry.install_attempts == 0 {
            return Err(AutoUnlockError::InvalidConfig(
                "retry.install_attempts must be at least 1".to_string(),
            ));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.retry.install_attempts == 0 {
            issues.push("retry.install_attempts must be at least 1".to_string());
        }
        if self.hardware.probe_timeout_secs == 0 || self.hardware.probe_timeout_secs > 30 {
            issues.push("hardware.probe_timeout_secs must be between 1 and 30".to_string());
        }

        for (field, value) in [
            ("paths.hook_source_dir", &self.paths.hook_source_dir),
            ("paths.events_root", &self.paths.events_root),
            ("paths.keyfile_path", &self.paths.keyfile_path),
            ("paths.backup_dir", &self.paths.backup_dir),
            ("paths.download_dir", &self.paths.download_dir),
            ("paths.array_state_file", &self.paths.array_state_file),
            ("hardware.serial_path", &self.hardware.serial_path),
        ] {
            if !Path::new(value.trim()).is_absolute() {
                issues.push(format!("{field} must be an absolute path (got `{value}`)"));
            }
        }

        issues
    }

    /// Resolve the boot keyfile path, honouring `AUTOUNLOCK_KEYFILE`.
    pub fn keyfile_path(&self) -> PathBuf {
        if let Ok(override_path) = env::var(KEYFILE_PATH_ENV) {
            if !override_path.is_empty() {
                return PathBuf::from(override_path);
            }
        }
        PathBuf::from(&self.paths.keyfile_path)
    }

    pub fn events_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.events_root)
    }

    pub fn hook_source_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.hook_source_dir)
    }

    /// Directory a run's archive lands in.
    pub fn archive_dir(&self, download_mode: bool) -> PathBuf {
        if download_mode {
            PathBuf::from(&self.paths.download_dir)
        } else {
            PathBuf::from(&self.paths.backup_dir)
        }
    }

    /// Per-route bound for the gateway probe.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.hardware.probe_timeout_secs.max(1))
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> AutoUnlockResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

/// Load/save access to the persisted configuration.
///
/// `update` is a load-modify-save sequence; it is not serialised against
/// other processes.
pub trait ConfigStore {
    fn load(&self) -> AutoUnlockResult<AutoUnlockConfig>;

    fn save(&self, config: &AutoUnlockConfig) -> AutoUnlockResult<()>;

    fn update<F>(&self, mutate: F) -> AutoUnlockResult<AutoUnlockConfig>
    where
        F: FnOnce(&mut AutoUnlockConfig),
    {
        let mut config = self.load()?;
        mutate(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

/// `ConfigStore` backed by a file, bootstrapped with defaults when absent.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> AutoUnlockResult<AutoUnlockConfig> {
        AutoUnlockConfig::load_or_bootstrap(&self.path)
    }

    fn save(&self, config: &AutoUnlockConfig) -> AutoUnlockResult<()> {
        let mut snapshot = config.clone();
        if snapshot.path.as_os_str().is_empty() {
            snapshot.path = self.path.clone();
            snapshot.format = ConfigFormat::from_path(&self.path);
        }
        snapshot.save()
    }
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let payload = match ConfigFormat::from_path(path) {
        ConfigFormat::Toml => bootstrap_template(),
        ConfigFormat::Yaml => serde_yaml::to_string(&AutoUnlockConfig::default())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?,
    };

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            file.write_all(payload.as_bytes())?;
            file.flush()?;
            // FAT-backed flash drives reject mode changes.
            #[cfg(unix)]
            let _ = fs::set_permissions(path, PermissionsExt::from_mode(0o600));
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: impl Into<String>) -> Self {
            let prev = env::var(key).ok();
            env::set_var(key, value.into());
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(prev) = &self.prev {
                env::set_var(self.key, prev);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    #[test]
    fn keyfile_path_respects_env_override() {
        let config = AutoUnlockConfig::default();
        let guard = EnvGuard::set(KEYFILE_PATH_ENV, "/tmp/override.key");
        assert_eq!(config.keyfile_path(), PathBuf::from("/tmp/override.key"));
        drop(guard);
        assert_eq!(config.keyfile_path(), PathBuf::from(default_keyfile_path()));
    }

    #[test]
    fn bootstrap_creates_safe_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("autounlock.toml");
        let config = AutoUnlockConfig::load_or_bootstrap(&path).unwrap();
        assert!(path.exists());
        assert!(!config.autounlock.enabled);
        assert!(config.autounlock.encrypted_disks_available);
        assert_eq!(config.retry.install_attempts, 2);
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn empty_document_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autounlock.toml");
        fs::write(&path, "").unwrap();
        let config = AutoUnlockConfig::load(&path).unwrap();
        assert!(!config.autounlock.enabled);
        assert!(config.autounlock.encrypted_disks_available);
        assert_eq!(config.format, ConfigFormat::Toml);
    }

    #[test]
    fn save_round_trips_through_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autounlock.yaml");
        let mut config = AutoUnlockConfig::with_path(&path);
        config.autounlock.enabled = true;
        config.save().unwrap();

        let reloaded = AutoUnlockConfig::load(&path).unwrap();
        assert_eq!(reloaded.format, ConfigFormat::Yaml);
        assert!(reloaded.autounlock.enabled);
    }

    #[test]
    fn load_rejects_zero_install_attempts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("autounlock.toml");
        fs::write(&path, "[retry]\ninstall_attempts = 0\n").unwrap();
        let err = AutoUnlockConfig::load(&path).unwrap_err();
        assert!(matches!(err, AutoUnlockError::InvalidConfig(_)));
    }

    #[test]
    fn file_store_update_persists_mutation() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("autounlock.toml"));
        store.update(|cfg| cfg.autounlock.enabled = true).unwrap();
        assert!(store.load().unwrap().autounlock.enabled);
    }

    #[test]
    fn resolve_binary_rejects_missing_override() {
        let err = resolve_binary(Some("/nonexistent/cryptsetup"), KNOWN_CRYPTSETUP_PATHS, "cryptsetup")
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cryptsetup"));
    }
}
