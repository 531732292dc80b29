//! Tracing initialization helpers.
//!
//! The engine itself only emits `tracing` events; embedding applications
//! decide where those go. These helpers cover the common case of a binary
//! that wants sane console output without wiring a subscriber by hand.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable console output.
    #[default]
    Pretty,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Installs a global `tracing` subscriber.
///
/// Filtering honors `RUST_LOG`; without it, engine events at `info` and
/// above are shown. Safe to call more than once; later calls are no-ops,
/// as is calling it when the application already installed a subscriber.
pub fn init_tracing(format: LogFormat) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inferflow=info"));
        let registry = tracing_subscriber::registry().with(filter);
        let result = match format {
            LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        };
        if let Err(error) = result {
            eprintln!("tracing subscriber already installed: {error}");
        }
    });
}
