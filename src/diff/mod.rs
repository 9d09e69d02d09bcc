//! Differential analyzer
//!
//! In diff mode every replayed request is re-sent to a shadow endpoint and
//! the two responses are compared body-to-body (everything past the header
//! block). Each call ends in exactly one of three outcomes: skip (errors),
//! match, or diff. Diverging requests are persisted to a sink for offline
//! study.

use crate::config::DiffConfig;
use crate::metrics::Metrics;
use crate::proto;
use crate::replay::{is_error, ReplayClient, ReplayResult};
use crate::sink::ByteSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Diverging-request sink queue capacity. The analyzer blocks when it is
/// full, which intentionally slows the whole diff pipeline.
const SINK_QUEUE_CAPACITY: usize = 100;

/// Latency histogram bucket upper bounds, in milliseconds; the last bucket
/// is unbounded.
const BUCKET_BOUNDS_MS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000];

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
    count: AtomicU64,
    sum_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.max_micros
            .fetch_max(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_micros.load(Ordering::Relaxed) / count)
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_micros.load(Ordering::Relaxed))
    }
}

/// Monotonic diff counters; `matches + diffs + skipped error pairs == total`.
#[derive(Debug, Default)]
pub struct DiffStats {
    pub total: AtomicU64,
    pub err_a: AtomicU64,
    pub err_b: AtomicU64,
    pub matches: AtomicU64,
    pub diffs: AtomicU64,
    /// Primary-side latency (successful sends only).
    pub rtt_a: LatencyHistogram,
    /// Shadow-side latency (successful sends only).
    pub rtt_b: LatencyHistogram,
}

/// Per-call outcome, for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    Match,
    Diff,
    SkippedErrors,
}

/// Shadow-send-and-compare stage shared by all workers of an output.
pub struct DiffReporter {
    ignore_errors: bool,
    stats: Arc<DiffStats>,
    total_diffs: AtomicU64,
    sink_tx: Option<mpsc::Sender<Vec<u8>>>,
    metrics: Arc<Metrics>,
}

impl DiffReporter {
    /// Build the reporter; when a sink is supplied, a background task drains
    /// the diverging-request queue into it.
    pub fn new(
        config: &DiffConfig,
        sink: Option<Box<dyn ByteSink>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let sink_tx = sink.map(|mut sink| {
            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SINK_QUEUE_CAPACITY);
            tokio::spawn(async move {
                while let Some(req) = rx.recv().await {
                    if let Err(e) = sink.write_record(&req) {
                        error!(error = %e, "failed to persist diverging request");
                    }
                }
            });
            tx
        });

        Arc::new(DiffReporter {
            ignore_errors: config.ignore_errors,
            stats: Arc::new(DiffStats::default()),
            total_diffs: AtomicU64::new(0),
            sink_tx,
            metrics,
        })
    }

    pub fn stats(&self) -> Arc<DiffStats> {
        self.stats.clone()
    }

    /// Shadow-send `req` and classify the response pair.
    pub async fn analyze(
        &self,
        shadow: &ReplayClient,
        req: &[u8],
        primary: &ReplayResult,
        primary_rtt: Duration,
    ) -> DiffOutcome {
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc("diffing.total");

        let start = Instant::now();
        let shadow_result = shadow.send(req).await;
        let shadow_rtt = start.elapsed();

        let a_errored = is_error(primary);
        let b_errored = is_error(&shadow_result);

        if a_errored {
            self.stats.err_a.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc("diffing.err.a");
        } else {
            self.stats.rtt_a.record(primary_rtt);
            self.metrics.timing("diffing.rtt.a", primary_rtt);
        }
        if b_errored {
            self.stats.err_b.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc("diffing.err.b");
            if let Err(e) = &shadow_result {
                warn!(error = %e, "shadow send failed");
            }
        } else {
            self.stats.rtt_b.record(shadow_rtt);
            self.metrics.timing("diffing.rtt.b", shadow_rtt);
        }

        if (a_errored && b_errored) || (self.ignore_errors && (a_errored || b_errored)) {
            return DiffOutcome::SkippedErrors;
        }

        let primary_raw: &[u8] = match primary {
            Ok(resp) => &resp.raw,
            Err(_) => &[],
        };
        let shadow_raw: &[u8] = match &shadow_result {
            Ok(resp) => &resp.raw,
            Err(_) => &[],
        };

        // Headers are free to differ; only the bytes past the blank line
        // decide equality.
        if proto::body(primary_raw) == proto::body(shadow_raw) {
            self.stats.matches.fetch_add(1, Ordering::Relaxed);
            self.metrics.inc("diffing.match");
            return DiffOutcome::Match;
        }

        self.stats.diffs.fetch_add(1, Ordering::Relaxed);
        self.metrics.inc("diffing.diff");
        let diff_num = self.total_diffs.fetch_add(1, Ordering::Relaxed) + 1;

        let primary_size = primary_raw.len() as i64;
        let shadow_size = shadow_raw.len() as i64;
        let primary_ms = primary_rtt.as_millis() as i64;
        let shadow_ms = shadow_rtt.as_millis() as i64;
        info!(
            "[DIFF {}] {} {} status: {} v {} size: {} v {} ({}) time: {}ms vs {}ms ({})",
            diff_num,
            String::from_utf8_lossy(proto::method(req)),
            String::from_utf8_lossy(proto::path(req)),
            String::from_utf8_lossy(proto::status_line(primary_raw)),
            String::from_utf8_lossy(proto::status_line(shadow_raw)),
            primary_size,
            shadow_size,
            primary_size - shadow_size,
            primary_ms,
            shadow_ms,
            primary_ms - shadow_ms,
        );

        if let Some(tx) = &self.sink_tx {
            // Block-on-full: backpressure deliberately slows diffing.
            if tx.send(req.to_vec()).await.is_err() {
                error!("diverging-request sink closed");
            }
        }

        DiffOutcome::Diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RefractError;
    use crate::replay::{ReplayHttpConfig, ReplayedResponse};
    use crate::sink::testing::MemorySink;
    use bytes::Bytes;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Fixture server answering every connection with the same bytes.
    fn fixture_server(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut socket) = stream else { break };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf);
                let _ = socket.write_all(response);
            }
        });
        format!("127.0.0.1:{}", addr.port())
    }

    fn shadow_client(addr: &str) -> ReplayClient {
        ReplayClient::new(
            addr,
            &ReplayHttpConfig {
                timeout: Duration::from_secs(2),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn dead_endpoint() -> String {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("127.0.0.1:{}", l.local_addr().unwrap().port());
        drop(l);
        addr
    }

    fn ok_response(date: &str, body: &str) -> ReplayResult {
        Ok(ReplayedResponse {
            raw: Bytes::from(format!(
                "HTTP/1.1 200 OK\r\nDate: {}\r\nContent-Length: {}\r\n\r\n{}",
                date,
                body.len(),
                body
            )),
            status: 200,
        })
    }

    fn reporter(ignore_errors: bool, sink: Option<Box<dyn ByteSink>>) -> Arc<DiffReporter> {
        DiffReporter::new(
            &DiffConfig {
                host: "unused".into(),
                requests_file: None,
                ignore_errors,
            },
            sink,
            Arc::new(Metrics::new()),
        )
    }

    const REQ: &[u8] = b"GET /compare HTTP/1.1\r\nHost: h\r\n\r\n";

    #[tokio::test]
    async fn test_match_despite_differing_headers() {
        let addr = fixture_server(b"HTTP/1.1 200 OK\r\nDate: Y\r\nContent-Length: 4\r\n\r\nBODY");
        let shadow = shadow_client(&addr);
        let reporter = reporter(false, None);

        let primary = ok_response("X", "BODY");
        let outcome = reporter
            .analyze(&shadow, REQ, &primary, Duration::from_millis(3))
            .await;

        assert_eq!(outcome, DiffOutcome::Match);
        let stats = reporter.stats();
        assert_eq!(stats.total.load(Ordering::Relaxed), 1);
        assert_eq!(stats.matches.load(Ordering::Relaxed), 1);
        assert_eq!(stats.diffs.load(Ordering::Relaxed), 0);
        assert_eq!(stats.rtt_a.count(), 1);
        assert_eq!(stats.rtt_b.count(), 1);
    }

    #[tokio::test]
    async fn test_diff_feeds_the_sink() {
        let addr = fixture_server(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBODX");
        let shadow = shadow_client(&addr);
        let sink = MemorySink::default();
        let records = sink.records.clone();
        let reporter = reporter(false, Some(Box::new(sink)));

        let primary = ok_response("X", "BODY");
        let outcome = reporter
            .analyze(&shadow, REQ, &primary, Duration::from_millis(3))
            .await;

        assert_eq!(outcome, DiffOutcome::Diff);
        assert_eq!(reporter.stats().diffs.load(Ordering::Relaxed), 1);

        // The writer task drains the queue shortly after.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let written = records.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], REQ);
    }

    #[tokio::test]
    async fn test_both_errors_skip() {
        let shadow = shadow_client(&dead_endpoint());
        let reporter = reporter(false, None);

        let primary: ReplayResult = Ok(ReplayedResponse {
            raw: Bytes::from_static(b"HTTP/1.1 503 Service Unavailable\r\n\r\n"),
            status: 503,
        });
        let outcome = reporter
            .analyze(&shadow, REQ, &primary, Duration::from_millis(1))
            .await;

        assert_eq!(outcome, DiffOutcome::SkippedErrors);
        let stats = reporter.stats();
        assert_eq!(stats.err_a.load(Ordering::Relaxed), 1);
        assert_eq!(stats.err_b.load(Ordering::Relaxed), 1);
        assert_eq!(stats.matches.load(Ordering::Relaxed), 0);
        assert_eq!(stats.diffs.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_ignore_errors_skips_single_sided_error() {
        let addr = fixture_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        let shadow = shadow_client(&addr);
        let reporter = reporter(true, None);

        let primary: ReplayResult = Err(RefractError::Timeout);
        let outcome = reporter
            .analyze(&shadow, REQ, &primary, Duration::from_millis(1))
            .await;

        assert_eq!(outcome, DiffOutcome::SkippedErrors);
        assert_eq!(reporter.stats().err_a.load(Ordering::Relaxed), 1);
        assert_eq!(reporter.stats().err_b.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_single_sided_error_without_ignore_is_a_diff() {
        let addr = fixture_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        let shadow = shadow_client(&addr);
        let reporter = reporter(false, None);

        let primary: ReplayResult = Err(RefractError::Timeout);
        let outcome = reporter
            .analyze(&shadow, REQ, &primary, Duration::from_millis(1))
            .await;

        assert_eq!(outcome, DiffOutcome::Diff);
    }

    #[tokio::test]
    async fn test_outcome_accounting_sums_to_total() {
        let addr = fixture_server(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBODY");
        let shadow = shadow_client(&addr);
        let reporter = reporter(false, None);

        for body in ["BODY", "DIFF", "BODY"] {
            let primary = ok_response("X", body);
            reporter
                .analyze(&shadow, REQ, &primary, Duration::from_millis(1))
                .await;
        }

        let stats = reporter.stats();
        let total = stats.total.load(Ordering::Relaxed);
        let matches = stats.matches.load(Ordering::Relaxed);
        let diffs = stats.diffs.load(Ordering::Relaxed);
        assert_eq!(total, 3);
        assert_eq!(matches, 2);
        assert_eq!(diffs, 1);
        assert_eq!(matches + diffs, total);
    }

    #[test]
    fn test_histogram_buckets() {
        let h = LatencyHistogram::default();
        h.record(Duration::from_millis(3));
        h.record(Duration::from_millis(7));
        h.record(Duration::from_secs(10));
        assert_eq!(h.count(), 3);
        assert_eq!(h.max(), Duration::from_secs(10));
        assert!(h.mean() > Duration::from_millis(3));
    }
}
