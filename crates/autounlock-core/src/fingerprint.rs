//! Hardware fingerprint collection and key derivation.

use crate::error::{AutoUnlockError, AutoUnlockResult};
use autounlock_provider::hardware::HardwareProbe;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

const UNKNOWN_SERIAL: &str = "unknown";

/// The two host identifiers the key is bound to.
#[derive(Clone, PartialEq, Eq)]
pub struct HardwareFingerprint {
    board_serial: String,
    gateway_mac: String,
}

impl HardwareFingerprint {
    /// Validate and normalise the inputs.
    ///
    /// The MAC is lower-cased so `AA:BB` and `aa:bb` derive the same key.
    pub fn new(board_serial: &str, gateway_mac: &str) -> AutoUnlockResult<Self> {
        let board_serial = checked_serial(board_serial)?;
        let gateway_mac = gateway_mac.trim().to_ascii_lowercase();
        if gateway_mac.is_empty() {
            return Err(AutoUnlockError::HardwareUnavailable(
                "gateway MAC address is empty".into(),
            ));
        }

        Ok(Self {
            board_serial: board_serial.to_string(),
            gateway_mac,
        })
    }

    pub fn board_serial(&self) -> &str {
        &self.board_serial
    }

    pub fn gateway_mac(&self) -> &str {
        &self.gateway_mac
    }

    /// Pure derivation: hex SHA-256 of `serial + "_" + mac`.
    pub fn derive(&self) -> DerivedKey {
        let mut hasher = Sha256::new();
        hasher.update(self.board_serial.as_bytes());
        hasher.update(b"_");
        hasher.update(self.gateway_mac.as_bytes());
        DerivedKey(Zeroizing::new(hex::encode(hasher.finalize())))
    }
}

fn checked_serial(raw: &str) -> AutoUnlockResult<&str> {
    let serial = raw.trim();
    if serial.is_empty() {
        return Err(AutoUnlockError::HardwareUnavailable(
            "motherboard serial is empty".into(),
        ));
    }
    if serial.eq_ignore_ascii_case(UNKNOWN_SERIAL) {
        return Err(AutoUnlockError::HardwareUnavailable(
            "motherboard serial reports `unknown`".into(),
        ));
    }
    Ok(serial)
}

impl fmt::Debug for HardwareFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareFingerprint")
            .field("board_serial", &self.board_serial)
            .field("gateway_mac", &self.gateway_mac)
            .finish()
    }
}

/// 64-character lowercase hex key; used verbatim as a LUKS passphrase.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey(Zeroizing<String>);

impl DerivedKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Probe the host and derive the hardware key.
///
/// Each default route is tried once, in order; the first gateway that answers
/// within `timeout` wins.
pub fn derive_key<H>(
    probe: &H,
    timeout: Duration,
) -> AutoUnlockResult<(HardwareFingerprint, DerivedKey)>
where
    H: HardwareProbe,
{
    let serial = probe
        .board_serial()
        .map_err(|err| AutoUnlockError::HardwareUnavailable(format!("board serial: {err}")))?;
    checked_serial(&serial)?;

    let routes = probe
        .default_routes()
        .map_err(|err| AutoUnlockError::HardwareUnavailable(format!("default routes: {err}")))?;
    if routes.is_empty() {
        return Err(AutoUnlockError::HardwareUnavailable(
            "no default route configured".into(),
        ));
    }

    let mut mac = None;
    for route in &routes {
        match probe.resolve_gateway_mac(route, timeout) {
            Ok(Some(found)) if !found.trim().is_empty() => {
                debug!("gateway {} answered on {}", route.gateway, route.interface);
                mac = Some(found);
                break;
            }
            Ok(_) => debug!(
                "gateway {} did not answer on {} within {:?}",
                route.gateway, route.interface, timeout
            ),
            Err(err) => warn!(
                "gateway probe for {} on {} failed: {err}",
                route.gateway, route.interface
            ),
        }
    }

    let mac = mac.ok_or_else(|| {
        AutoUnlockError::HardwareUnavailable(format!(
            "no gateway MAC resolved across {} default route(s)",
            routes.len()
        ))
    })?;

    let fingerprint = HardwareFingerprint::new(&serial, &mac)?;
    let key = fingerprint.derive();
    info!("hardware key derived from board serial and gateway MAC");
    Ok((fingerprint, key))
}
