//! Logging initialization.
//!
//! Library code only emits `tracing` events; binaries call [`init`] once.

use std::sync::Once;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

/// Logging profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Human-readable output on stderr
    Development,
    /// JSON structured output on stderr
    Production,
    /// No output (tests)
    Quiet,
}

static INIT_ONCE: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` overrides the default filter of the selected profile.
pub fn init(profile: Profile, verbose: bool) {
    INIT_ONCE.call_once(|| {
        let default_filter = if verbose {
            "sql_subsetter=debug"
        } else {
            "sql_subsetter=warn"
        };
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
        };

        match profile {
            Profile::Development => {
                tracing_subscriber::fmt()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_env_filter(filter())
                    .init();
            }
            Profile::Production => {
                tracing_subscriber::fmt()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_env_filter(filter())
                    .init();
            }
            Profile::Quiet => {
                tracing_subscriber::registry().init();
            }
        }
    });
}
