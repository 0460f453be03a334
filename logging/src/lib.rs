#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod file;

use anyhow::{Context as _, Result};
use tracing::{subscriber::DefaultGuard, Subscriber};
use tracing_log::LogTracer;
use tracing_subscriber::{filter::ParseError, util::SubscriberInitExt as _, EnvFilter};

/// Registers `subscriber` as the global default and bridges `log` records
/// from our dependencies into it.
pub fn init<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    tracing::subscriber::set_global_default(subscriber)
        .context("Could not set global default subscriber")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
///
/// A catch-all directive like `debug` would otherwise drown the agent's own
/// events in service-control and runtime chatter. Restating a crate in the
/// directive with a lower filter re-activates it, e.g. `windows_service=debug`.
pub fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    const IRRELEVANT_CRATES: &str = "windows_service=warn,mio=warn";

    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

pub fn test_global(directives: &str) {
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(directives)
            .finish(),
    )
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_accepts_empty_directives() {
        try_filter("").unwrap();
    }

    #[test]
    fn filter_accepts_plain_level() {
        try_filter("debug").unwrap();
    }

    #[test]
    fn filter_rejects_garbage() {
        assert!(try_filter("foo=notalevel").is_err());
    }
}
