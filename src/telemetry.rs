//! Logging initialization.
//!
//! The crate only emits `tracing` events; installing a subscriber is the
//! embedding application's choice. [`init`] is a convenience for binaries and
//! tests that want the standard setup.

use std::sync::Once;

use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Logging profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Human-readable output, debug level for this crate.
    Development,
    /// JSON structured output, info level.
    Production,
    /// Registry without output; keeps test logs quiet.
    Test,
}

static INIT_ONCE: Once = Once::new();

/// Installs a global `tracing` subscriber for `profile`.
///
/// `RUST_LOG` overrides the profile's default filter. Only the first call in a
/// process has any effect, and an already-installed global subscriber is left
/// in place.
pub fn init(profile: Profile) {
    INIT_ONCE.call_once(|| {
        let filter = |default: &str| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let _ = match profile {
            Profile::Development => tracing_subscriber::fmt()
                .with_env_filter(filter("devconfirm=debug"))
                .with_thread_names(true)
                .finish()
                .try_init(),
            Profile::Production => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter("devconfirm=info"))
                .finish()
                .try_init(),
            Profile::Test => tracing_subscriber::registry().try_init(),
        };
    });
}
