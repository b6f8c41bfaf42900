//! Tracing setup for the `ferry` binary.
//!
//! Logs go to stderr so that stdout stays free for stage lines and `--json`
//! results. `RUST_LOG` overrides the level chosen here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per event, with the current span attached.
    pub json: bool,
    /// Default to DEBUG instead of INFO.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.log_json,
            verbose: config.verbose,
        }
    }
}

fn default_directive(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!("ferry={}", level.as_str().to_lowercase())
}

/// Install the global subscriber. Call once, after config is loaded.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Lets through at most one event per interval. Used for upload progress,
/// which would otherwise log every chunk.
pub struct LogThrottle {
    interval_ms: u64,
    /// Milliseconds since `start` of the last event let through.
    last_ms: AtomicU64,
    start: Instant,
}

const NEVER: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(NEVER),
            start: Instant::now(),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        if last != NEVER && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        // Losing the race means another caller just logged.
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
