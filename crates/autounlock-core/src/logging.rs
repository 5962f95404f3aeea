//! Process-wide logger initialisation.

use env_logger::{Builder, Env};
use std::sync::Once;

const LOG_ENV: &str = "AUTOUNLOCK_LOG";

static INIT: Once = Once::new();

/// Install the global logger. `default_level` applies when neither
/// `AUTOUNLOCK_LOG` nor `RUST_LOG` is set. Safe to call more than once.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let fallback = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
        let env = Env::default().filter_or(LOG_ENV, fallback);
        let _ = Builder::from_env(env)
            .format_timestamp_secs()
            .format_target(false)
            .try_init();
    });
}
