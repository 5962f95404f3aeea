//! Provider contract for the host identifiers the hardware key is derived from.

use serde::Serialize;
use std::error::Error;
use std::time::Duration;

/// A default route candidate whose gateway may anchor the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefaultRoute {
    /// Gateway IP address.
    pub gateway: String,
    /// Egress interface name (e.g. `br0`, `eth0`).
    pub interface: String,
}

/// Abstraction over board and network identifier probes.
pub trait HardwareProbe {
    type Error: Error + Send + Sync + 'static;

    /// Raw motherboard serial as reported by firmware. May be empty.
    fn board_serial(&self) -> Result<String, Self::Error>;

    /// Default routes in kernel preference order.
    fn default_routes(&self) -> Result<Vec<DefaultRoute>, Self::Error>;

    /// Actively resolve the gateway's hardware address on `route`.
    ///
    /// Must give up after `timeout`. `Ok(None)` means the neighbour did not
    /// answer; the caller moves on to the next route.
    fn resolve_gateway_mac(
        &self,
        route: &DefaultRoute,
        timeout: Duration,
    ) -> Result<Option<String>, Self::Error>;
}
