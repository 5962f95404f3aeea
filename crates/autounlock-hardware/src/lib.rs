#![forbid(unsafe_code)]

//! Host probes feeding the hardware fingerprint and readiness checks.
//!
//! - board serial from sysfs, falling back to `dmidecode`
//! - default routes and neighbour entries via `ip -j`
//! - active gateway resolution via `arping`
//! - array state from the `var.ini` key/value file

mod array;
mod network;
mod system;

pub use array::VarIniArrayProbe;
pub use system::SystemHardwareProbe;
