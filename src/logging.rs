//! Process-wide tracing setup.

use crate::config::DebugLevel;

pub fn splash() {
    tracing::info!("Warden — container orchestration control plane");
    tracing::info!("version {}", env!("CARGO_PKG_VERSION"));
}

/// Installs the global `tracing` subscriber. Verbosity follows `DEBUG`:
/// `off` → warn, `info` → info, `debug`/`super` → debug.
pub fn setup(level: DebugLevel) {
    let filter = match level {
        DebugLevel::Off => "warn",
        DebugLevel::Info => "info",
        DebugLevel::Debug | DebugLevel::Super => "debug",
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set");
    }
}
