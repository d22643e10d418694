//! Logging initialization for the `cairn` binary, grounded on the teacher's
//! `init_simple_logging` pattern: an `EnvFilter` honoring `RUST_LOG`, falling
//! back to the configured level, with JSON or human-readable output to
//! stdout. No OpenTelemetry/file-rotation layer — those are out of scope for
//! a one-shot CLI harness.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cairn={},cairn_txn={},cairn_store={}",
            config.level, config.level, config.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
