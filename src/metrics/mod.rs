//! Metrics facade
//!
//! A name-keyed counter/gauge/timer registry shared across the pipeline as an
//! explicit `Arc<Metrics>` (no process-wide singleton). A reporter task can
//! periodically ship samples to a graphite-style plaintext aggregator and/or
//! log them locally.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// How often samples are shipped to a remote aggregator.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// How often samples are logged locally when log reporting is enabled.
const LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct TimerState {
    count: u64,
    sum: Duration,
    max: Duration,
}

/// Name → counter/gauge/timer sink.
///
/// Names are free-form strings; metrics are created on first use. All
/// operations are callable from any task.
pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    timers: DashMap<String, Mutex<TimerState>>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            timers: DashMap::new(),
        }
    }

    /// Increment a counter by one.
    pub fn inc(&self, name: &str) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Set a gauge to an absolute value.
    pub fn gauge(&self, name: &str, value: i64) {
        match self.gauges.get(name) {
            Some(gauge) => gauge.store(value, Ordering::Relaxed),
            None => {
                self.gauges
                    .entry(name.to_string())
                    .or_insert_with(|| AtomicI64::new(0))
                    .store(value, Ordering::Relaxed);
            }
        }
    }

    /// Record one duration sample into a timer.
    pub fn timing(&self, name: &str, duration: Duration) {
        let entry = self
            .timers
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(TimerState::default()));
        let mut state = entry.lock();
        state.count += 1;
        state.sum += duration;
        if duration > state.max {
            state.max = duration;
        }
    }

    /// Current value of a counter (zero if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current value of a gauge (zero if never set).
    pub fn gauge_value(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sample count of a timer.
    pub fn timer_count(&self, name: &str) -> u64 {
        self.timers.get(name).map(|t| t.lock().count).unwrap_or(0)
    }

    /// Snapshot all metrics as `(name, value)` pairs; timers expand into
    /// `.count`, `.mean_ms` and `.max_ms` samples.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut samples = Vec::new();
        for entry in self.counters.iter() {
            samples.push((entry.key().clone(), entry.load(Ordering::Relaxed) as f64));
        }
        for entry in self.gauges.iter() {
            samples.push((entry.key().clone(), entry.load(Ordering::Relaxed) as f64));
        }
        for entry in self.timers.iter() {
            let state = entry.lock();
            samples.push((format!("{}.count", entry.key()), state.count as f64));
            let mean_ms = if state.count > 0 {
                state.sum.as_secs_f64() * 1000.0 / state.count as f64
            } else {
                0.0
            };
            samples.push((format!("{}.mean_ms", entry.key()), mean_ms));
            samples.push((
                format!("{}.max_ms", entry.key()),
                state.max.as_secs_f64() * 1000.0,
            ));
        }
        samples.sort_by(|a, b| a.0.cmp(&b.0));
        samples
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Reporter configuration: remote aggregator and/or local log.
#[derive(Debug, Clone, Default)]
pub struct ReporterConfig {
    /// `host:port` of a graphite-style plaintext aggregator.
    pub graphite: Option<String>,
    /// Prefix prepended to every shipped metric name.
    pub graphite_prefix: String,
    /// Log a snapshot locally every minute.
    pub log_samples: bool,
}

/// Spawn the background reporter tasks for a shared registry.
pub fn spawn_reporter(metrics: Arc<Metrics>, config: ReporterConfig) {
    if let Some(addr) = config.graphite.clone() {
        info!(addr = %addr, "stats reporting to graphite");
        let metrics = metrics.clone();
        let prefix = config.graphite_prefix.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPORT_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = ship_graphite(&metrics, &addr, &prefix).await {
                    debug!(error = %e, "graphite report failed");
                }
            }
        });
    }

    if config.log_samples {
        info!("stats reporting enabled");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOG_INTERVAL);
            loop {
                ticker.tick().await;
                for (name, value) in metrics.snapshot() {
                    info!(metric = %name, value, "metrics sample");
                }
            }
        });
    }
}

async fn ship_graphite(metrics: &Metrics, addr: &str, prefix: &str) -> std::io::Result<()> {
    let samples = metrics.snapshot();
    if samples.is_empty() {
        return Ok(());
    }

    let timestamp = chrono::Utc::now().timestamp();
    let mut payload = String::new();
    for (name, value) in samples {
        if prefix.is_empty() {
            payload.push_str(&format!("{} {} {}\n", name, value, timestamp));
        } else {
            payload.push_str(&format!("{}.{} {} {}\n", prefix, name, value, timestamp));
        }
    }

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let m = Metrics::new();
        m.inc("capture.request");
        m.inc("capture.request");
        assert_eq!(m.counter("capture.request"), 2);
        assert_eq!(m.counter("never.touched"), 0);
    }

    #[test]
    fn test_gauge_overwrites() {
        let m = Metrics::new();
        m.gauge("queue.depth", 4);
        m.gauge("queue.depth", 2);
        assert_eq!(m.gauge_value("queue.depth"), 2);
    }

    #[test]
    fn test_timing_accumulates() {
        let m = Metrics::new();
        m.timing("rtt", Duration::from_millis(10));
        m.timing("rtt", Duration::from_millis(30));
        assert_eq!(m.timer_count("rtt"), 2);

        let samples = m.snapshot();
        let mean = samples
            .iter()
            .find(|(n, _)| n == "rtt.mean_ms")
            .map(|(_, v)| *v)
            .unwrap();
        assert!((mean - 20.0).abs() < 0.01);
        let max = samples
            .iter()
            .find(|(n, _)| n == "rtt.max_ms")
            .map(|(_, v)| *v)
            .unwrap();
        assert!((max - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let m = Metrics::new();
        m.inc("b");
        m.inc("a");
        let names: Vec<String> = m.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_concurrent_increments() {
        let m = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.inc("shared");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter("shared"), 8000);
    }
}
