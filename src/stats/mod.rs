//! Queue-depth stats
//!
//! A scalar aggregator sampled on every queue write and reported once per
//! period. The "mean" is a smoothed value, `(mean + v) / 2`, not an
//! arithmetic mean; downstream dashboards depend on that behavior.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Reporting period in seconds.
const RATE_SECS: u64 = 5;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Window {
    latest: i64,
    mean: i64,
    max: i64,
    count: u64,
}

/// Periodic scalar aggregate: latest, smoothed mean, max, count.
pub struct QueueStats {
    name: String,
    enabled: bool,
    window: Mutex<Window>,
}

impl QueueStats {
    /// Create the aggregator; when `enabled`, a background task logs and
    /// resets the window every five seconds.
    pub fn new(name: &str, enabled: bool) -> Arc<Self> {
        let stats = Arc::new(QueueStats {
            name: name.to_string(),
            enabled,
            window: Mutex::new(Window::default()),
        });

        if enabled {
            info!("{}:latest,mean,max,count,count/second", stats.name);
            let reporter = stats.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(RATE_SECS));
                ticker.tick().await; // first tick is immediate
                loop {
                    ticker.tick().await;
                    info!("{}", reporter.report_and_reset());
                }
            });
        }

        stats
    }

    /// Record one sample.
    pub fn write(&self, latest: i64) {
        if !self.enabled {
            return;
        }
        let mut w = self.window.lock();
        if latest > w.max {
            w.max = latest;
        }
        if latest != 0 {
            w.mean = (w.mean + latest) / 2;
        }
        w.latest = latest;
        w.count += 1;
    }

    /// Format the current window and reset it.
    pub fn report_and_reset(&self) -> String {
        let mut w = self.window.lock();
        let line = format!(
            "{}:{},{},{},{},{}",
            self.name,
            w.latest,
            w.mean,
            w.max,
            w.count,
            w.count / RATE_SECS
        );
        *w = Window::default();
        line
    }

    #[cfg(test)]
    fn snapshot(&self) -> (i64, i64, i64, u64) {
        let w = self.window.lock();
        (w.latest, w.mean, w.max, w.count)
    }
}
