//! Provider contract for storage-array state.

use std::error::Error;

/// Reports whether the host's storage array has been started.
pub trait ArrayProbe {
    type Error: Error + Send + Sync + 'static;

    fn array_started(&self) -> Result<bool, Self::Error>;
}
