//! File logger for the agent service.
//!
//! The log file is never rotated for the duration of the process; the agent
//! is short-lived (the span of one exam sitting) and rotation would only
//! complicate collecting the file afterwards.

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::Layer;

/// Create a new file logger layer writing to `<base_name>.log` in `log_dir`.
pub fn layer<T>(
    log_dir: &Path,
    base_name: &str,
) -> (Box<dyn Layer<T> + Send + Sync + 'static>, Handle)
where
    T: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let appender = tracing_appender::rolling::never(log_dir, format!("{base_name}.log"));
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .boxed();

    // Return the guard so that the caller maintains a handle to it. Otherwise,
    // we have to wait for tracing_appender to flush the logs before exiting.
    // See https://docs.rs/tracing-appender/latest/tracing_appender/non_blocking/struct.WorkerGuard.html
    (layer, Handle { _guard: guard })
}

/// Must be kept alive for as long as events should reach the file.
///
/// Dropping it flushes buffered events and stops the background writer.
#[must_use]
pub struct Handle {
    _guard: WorkerGuard,
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::{layer::SubscriberExt as _, Registry};

    #[test]
    fn events_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();

        {
            let (layer, handle) = super::layer(dir.path(), "smoke");
            let subscriber = Registry::default().with(layer);
            let _guard = tracing::subscriber::set_default(subscriber);
            tracing::error!("write me to disk");
            drop(handle);
        }

        let contents = std::fs::read_to_string(dir.path().join("smoke.log")).unwrap();
        assert!(contents.contains("write me to disk"));
    }
}
