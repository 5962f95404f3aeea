#![forbid(unsafe_code)]

//! Provider contracts shared across the auto-unlock workspace.
//!
//! Workflows in `autounlock-core` are written against these traits so the
//! slot-safety logic can be exercised without touching real block devices,
//! while `autounlock-luks` and `autounlock-hardware` supply the host-backed
//! implementations.

pub mod hardware;
pub mod host;
pub mod luks;
