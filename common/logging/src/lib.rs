use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{EnvFilter, FilterFn, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

/// The minimum interval between repeated log messages guarded by a `TimeLatch`.
const LOG_DEBOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Targets of the HTTP stack, hidden unless `dep_logs` is set.
const DEPENDENCY_TARGETS: &[&str] = &["hyper", "reqwest", "mockito", "h2"];

/// Provides de-bounce functionality for logging.
#[derive(Default)]
pub struct TimeLatch(Option<Instant>);

impl TimeLatch {
    /// Returns true on the first call, then at most once every `LOG_DEBOUNCE_INTERVAL`.
    pub fn elapsed(&mut self) -> bool {
        let now = Instant::now();

        let is_elapsed = self.0.is_none_or(|elapse_time| now > elapse_time);

        if is_elapsed {
            self.0 = Some(now + LOG_DEBOUNCE_INTERVAL);
        }

        is_elapsed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub debug_level: String,
    /// Emit one JSON object per line instead of the human readable format.
    pub json: bool,
    pub disable_timestamp: bool,
    /// Include log lines from the HTTP dependencies.
    pub dep_logs: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            debug_level: "info".to_string(),
            json: false,
            disable_timestamp: false,
            dep_logs: false,
        }
    }
}

pub fn parse_level(level: &str) -> Result<LevelFilter, String> {
    match level.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        other => Err(format!("Unsupported log level: {other}")),
    }
}

fn filter_dependency_log(meta: &tracing::Metadata<'_>) -> bool {
    let target = meta.target();
    !DEPENDENCY_TARGETS
        .iter()
        .any(|dependency| target.starts_with(dependency))
}

/// Installs the global subscriber for a harness process, writing to stdout through a
/// non-blocking writer.
///
/// `RUST_LOG` takes precedence over `debug_level`. The returned guard must be held for as
/// long as logs should be flushed.
pub fn init_logger(config: &LoggerConfig) -> Result<WorkerGuard, String> {
    let level = parse_level(&config.debug_level)?;
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_string().to_lowercase()))
        .map_err(|e| format!("Invalid log filter: {e}"))?;

    let (writer, guard): (NonBlocking, WorkerGuard) =
        tracing_appender::non_blocking(std::io::stdout());

    let dependency_filter = if config.dep_logs {
        None
    } else {
        Some(FilterFn::new(
            filter_dependency_log as fn(&tracing::Metadata<'_>) -> bool,
        ))
    };

    let stdout_layer = match (config.json, config.disable_timestamp) {
        (true, true) => fmt::layer()
            .json()
            .without_time()
            .with_writer(writer)
            .boxed(),
        (true, false) => fmt::layer().json().with_writer(writer).boxed(),
        (false, true) => fmt::layer().without_time().with_writer(writer).boxed(),
        (false, false) => fmt::layer().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer.with_filter(dependency_filter))
        .try_init()
        .map_err(|e| format!("Unable to set global subscriber: {e}"))?;

    Ok(guard)
}

/// Return a tracing subscriber suitable for test usage.
///
/// By default no logs will be printed, but they can be enabled via
/// the `test_logger` feature.  This feature can be enabled for any
/// dependent crate by passing `--features logging/test_logger`, e.g.
/// ```bash
/// cargo test -p mock_consensus --features logging/test_logger
/// ```
pub fn create_test_tracing_subscriber() {
    if cfg!(feature = "test_logger") {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("debug"))
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_latch_fires_once_per_interval() {
        let mut latch = TimeLatch::default();

        // The first call fires and arms the latch.
        assert!(latch.elapsed());
        assert!(!latch.elapsed());

        latch.0 = Some(Instant::now() - Duration::from_secs(1));
        assert!(latch.elapsed());
        assert!(!latch.elapsed());
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("DEBUG"), Ok(LevelFilter::DEBUG));
        assert_eq!(parse_level("warn"), Ok(LevelFilter::WARN));
        assert!(parse_level("verbose").is_err());
    }
}
