pub mod bus;
pub mod config;
pub mod consumers;
pub mod error;
pub mod handlers;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod search;
pub mod server;
pub mod signals;
pub mod storage;
pub mod tail;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` wins over `level` when set. `format = "json"` selects the
/// JSON formatter; anything else the human-readable one.
///
/// Note: This function can only be called once per process.
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    if format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
