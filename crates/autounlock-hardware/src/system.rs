//! System-backed `HardwareProbe`.

use crate::network::{parse_arping_reply, parse_neighbour, parse_routes};
use autounlock_core::config::{
    detect_binary_path, resolve_binary, KNOWN_ARPING_PATHS, KNOWN_DMIDECODE_PATHS, KNOWN_IP_PATHS,
};
use autounlock_core::error::{AutoUnlockError, AutoUnlockResult};
use autounlock_core::process::ExternalCommand;
use autounlock_core::AutoUnlockConfig;
use autounlock_provider::hardware::{DefaultRoute, HardwareProbe};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Slack on top of arping's own deadline before the child is killed.
const ARPING_GRACE: Duration = Duration::from_secs(1);

/// Reads identifiers from sysfs, `dmidecode`, `ip`, and `arping`.
#[derive(Debug, Clone)]
pub struct SystemHardwareProbe {
    serial_path: PathBuf,
    ip: ExternalCommand,
    arping: Option<PathBuf>,
    dmidecode: Option<ExternalCommand>,
}

impl SystemHardwareProbe {
    /// `ip` is required; `arping` and `dmidecode` are used when present.
    pub fn from_config(config: &AutoUnlockConfig) -> AutoUnlockResult<Self> {
        let ip = resolve_binary(config.paths.ip_path.as_deref(), KNOWN_IP_PATHS, "ip")?;
        let arping = optional_binary(config.paths.arping_path.as_deref(), KNOWN_ARPING_PATHS);
        if arping.is_none() {
            warn!("arping not found; gateway resolution falls back to the neighbour table");
        }
        let dmidecode =
            optional_binary(config.paths.dmidecode_path.as_deref(), KNOWN_DMIDECODE_PATHS);
        Ok(Self::new(&config.hardware.serial_path, ip, arping, dmidecode))
    }

    pub fn new(
        serial_path: impl Into<PathBuf>,
        ip: impl Into<PathBuf>,
        arping: Option<PathBuf>,
        dmidecode: Option<PathBuf>,
    ) -> Self {
        Self {
            serial_path: serial_path.into(),
            ip: ExternalCommand::new(ip),
            arping,
            dmidecode: dmidecode.map(ExternalCommand::new),
        }
    }

    fn sysfs_serial(&self) -> Option<String> {
        match fs::read_to_string(&self.serial_path) {
            Ok(raw) => Some(raw.trim().to_string()).filter(|s| !s.is_empty()),
            Err(err) => {
                debug!("read {}: {err}", self.serial_path.display());
                None
            }
        }
    }

    fn dmidecode_serial(&self) -> AutoUnlockResult<Option<String>> {
        let Some(dmidecode) = &self.dmidecode else {
            return Ok(None);
        };
        let out = dmidecode.run(&["-s", "baseboard-serial-number"], None)?;
        if !out.success() {
            debug!("dmidecode exited {}: {}", out.status, out.diagnostic());
            return Ok(None);
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string))
    }

    fn neighbour_mac(&self, route: &DefaultRoute) -> AutoUnlockResult<Option<String>> {
        let out = self.ip.run(
            &[
                "-j",
                "neigh",
                "show",
                route.gateway.as_str(),
                "dev",
                route.interface.as_str(),
            ],
            None,
        )?;
        if !out.success() {
            debug!("ip neigh exited {}: {}", out.status, out.diagnostic());
            return Ok(None);
        }
        parse_neighbour(&out.stdout)
    }

    /// Stdout of a successful probe; `None` when the gateway stayed silent.
    fn arping(&self, binary: &Path, route: &DefaultRoute, timeout: Duration) -> Option<String> {
        let secs = timeout.as_secs().max(1).to_string();
        let command = ExternalCommand::with_timeout(binary, timeout + ARPING_GRACE);
        let args = [
            "-c",
            "1",
            "-w",
            secs.as_str(),
            "-I",
            route.interface.as_str(),
            route.gateway.as_str(),
        ];
        match command.run(&args, None) {
            Ok(out) if out.success() => Some(out.stdout),
            Ok(out) => {
                debug!(
                    "arping {} on {} exited {}",
                    route.gateway, route.interface, out.status
                );
                None
            }
            Err(err) => {
                debug!("arping {} on {}: {err}", route.gateway, route.interface);
                None
            }
        }
    }
}

fn optional_binary(configured: Option<&str>, candidates: &[&str]) -> Option<PathBuf> {
    match configured.map(str::trim).filter(|path| !path.is_empty()) {
        Some(path) => Some(PathBuf::from(path)).filter(|p| p.exists()),
        None => detect_binary_path(candidates),
    }
}

impl HardwareProbe for SystemHardwareProbe {
    type Error = AutoUnlockError;

    fn board_serial(&self) -> AutoUnlockResult<String> {
        if let Some(serial) = self.sysfs_serial() {
            return Ok(serial);
        }
        Ok(self.dmidecode_serial()?.unwrap_or_default())
    }

    fn default_routes(&self) -> AutoUnlockResult<Vec<DefaultRoute>> {
        let out = self.ip.run(&["-j", "route", "show", "default"], None)?;
        if !out.success() {
            return Err(AutoUnlockError::HardwareUnavailable(format!(
                "ip route exited {}: {}",
                out.status,
                out.diagnostic()
            )));
        }
        parse_routes(&out.stdout)
    }

    fn resolve_gateway_mac(
        &self,
        route: &DefaultRoute,
        timeout: Duration,
    ) -> AutoUnlockResult<Option<String>> {
        let Some(binary) = &self.arping else {
            return self.neighbour_mac(route);
        };
        let Some(reply) = self.arping(binary, route, timeout) else {
            return Ok(None);
        };
        if let Some(mac) = self.neighbour_mac(route)? {
            return Ok(Some(mac));
        }
        Ok(parse_arping_reply(&reply))
    }
}
