#![forbid(unsafe_code)]

//! System provider for LUKS headers.
//!
//! Integrates with the host via:
//! - `cryptsetup` (test/add/kill slots, header backup/restore, tokens)
//! - `lsblk -J` for device discovery

mod command;
mod parse;
mod system;

pub use system::SystemLuksProvider;
