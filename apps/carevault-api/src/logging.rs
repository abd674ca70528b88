//! Structured JSON logging.
//!
//! Filter precedence: `RUST_LOG`, then the configured level. The
//! resilience components log on the `rate_limit`, `circuit_breaker`,
//! `tenant_context` and `audit` targets, so those can be tuned separately,
//! e.g. `info,circuit_breaker=debug`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|e| {
            eprintln!("Invalid log filter '{default_filter}': {e}");
            std::process::exit(1);
        });

    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}
