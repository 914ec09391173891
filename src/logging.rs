//! Tracing setup and log rate limiting.
//!
//! The library only emits `tracing` events under the `uiprobe` target. A host
//! application keeps its own subscriber; the `uiprobe` binary (or a host
//! without one) calls [`init`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Default)]
pub struct LogConfig {
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
    /// Debug instead of info.
    pub verbose: bool,
    /// Extra targets enabled at the same level, e.g. the host application's crate.
    pub targets: Vec<String>,
}

/// Default filter: `uiprobe` plus `config.targets`, all at the chosen level.
/// `RUST_LOG` replaces it entirely.
pub fn filter_directives(config: &LogConfig) -> String {
    let level = if config.verbose { Level::DEBUG } else { Level::INFO };
    let level = level.as_str().to_lowercase();

    std::iter::once("uiprobe")
        .chain(config.targets.iter().map(String::as_str))
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install a global subscriber. Connection spans carry the request id, so
/// JSON output includes the current span and span close events.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_names(true))
            .init();
    }
}

/// Per-site rate limit for warnings that can fire on every request.
///
/// Each call site passes its own key. A site is admitted at most once per
/// interval; admission reports how many events were swallowed since the
/// previous admitted one so the warning can carry the count.
pub struct LogThrottle {
    interval: Duration,
    sites: Mutex<HashMap<&'static str, Site>>,
}

struct Site {
    last: Instant,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sites: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(suppressed)` when `site` may log now, `None` otherwise.
    pub fn admit(&self, site: &'static str) -> Option<u64> {
        let now = Instant::now();
        let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);

        match sites.get_mut(site) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                entry.last = now;
                Some(std::mem::take(&mut entry.suppressed))
            }
            None => {
                sites.insert(site, Site { last: now, suppressed: 0 });
                Some(0)
            }
        }
    }
}
