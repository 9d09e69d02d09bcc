//! Replay output: bounded queue drained by an adaptive worker pool
//!
//! Each output owns a bounded queue of serialized request payloads and a
//! pool of workers that race to drain it. With `workers = 0` the pool is
//! dynamic: backlog on write spawns more workers, and a worker that sits
//! idle for about two seconds retires, except the last one. A fixed pool
//! spawns exactly N workers that never retire.

mod queue;

pub use queue::BoundedQueue;

use crate::config::OutputConfig;
use crate::diff::DiffReporter;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::observer::EsObserver;
use crate::replay::{ReplayClient, ReplayHttpConfig};
use crate::sink::FileSink;
use crate::stats::QueueStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Starting pool size when dynamic scaling is enabled.
const INITIAL_DYNAMIC_WORKERS: u64 = 10;

/// Queue capacity; producers block when it is full.
const QUEUE_CAPACITY: usize = 100;

/// Worker poll timeout; each expiry counts toward retirement.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll expiries before an idle dynamic worker retires (~2 s).
const DEATH_COUNT_LIMIT: u32 = 20;

/// Worker pool bound to one replay target.
pub struct HttpOutput {
    // Worker count mutations are atomic; keep this first in the struct so
    // its storage stays 64-bit aligned.
    active_workers: AtomicU64,

    target: String,
    workers: u64,
    client_config: ReplayHttpConfig,
    diff_host: Option<String>,

    queue: BoundedQueue<Vec<u8>>,
    need_worker_tx: mpsc::Sender<u64>,

    queue_stats: Arc<QueueStats>,
    diff: Option<Arc<DiffReporter>>,
    observer: Option<Arc<EsObserver>>,
    metrics: Arc<Metrics>,
}

impl HttpOutput {
    /// Create the output and start its worker pool.
    pub fn new(target: &str, config: &OutputConfig, metrics: Arc<Metrics>) -> Result<Arc<Self>> {
        let client_config = ReplayHttpConfig {
            redirect_limit: config.redirect_limit,
            timeout: config.timeout,
            preserve_host: config.preserve_host,
            debug: config.debug,
        };

        let observer = match &config.elastic_search {
            Some(endpoint) => Some(Arc::new(EsObserver::new(endpoint)?)),
            None => None,
        };

        let diff = match &config.diff {
            Some(diff_config) => {
                let sink = match &diff_config.requests_file {
                    Some(path) => {
                        Some(Box::new(FileSink::open(path)?) as Box<dyn crate::sink::ByteSink>)
                    }
                    None => None,
                };
                Some(DiffReporter::new(diff_config, sink, metrics.clone()))
            }
            None => None,
        };

        let (need_worker_tx, need_worker_rx) = mpsc::channel(1);

        let output = Arc::new(HttpOutput {
            active_workers: AtomicU64::new(0),
            target: target.to_string(),
            workers: config.workers,
            client_config,
            diff_host: config.diff.as_ref().map(|d| d.host.clone()),
            queue: BoundedQueue::new(QUEUE_CAPACITY),
            need_worker_tx,
            queue_stats: QueueStats::new("output_http", config.stats),
            diff,
            observer,
            metrics,
        });

        let initial = if output.workers == 0 {
            INITIAL_DYNAMIC_WORKERS
        } else {
            output.workers
        };
        // Capacity-1 channel; the pool is empty so this cannot fail.
        let _ = output.need_worker_tx.try_send(initial);

        tokio::spawn(Self::supervisor(output.clone(), need_worker_rx));

        info!(target = %output.target, workers = output.workers, "HTTP output started");
        Ok(output)
    }

    /// Current active worker count.
    pub fn active_workers(&self) -> u64 {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Current queue depth.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn diff_reporter(&self) -> Option<Arc<DiffReporter>> {
        self.diff.clone()
    }

    /// Enqueue one serialized request payload.
    ///
    /// The bytes are copied so the caller may reuse its buffer. Always
    /// reports the full length as written; blocks only while the queue is
    /// full, which is the intended backpressure point.
    pub async fn write(&self, data: &[u8]) -> usize {
        self.queue.push(data.to_vec()).await;

        let depth = self.queue.len() as u64;
        self.queue_stats.write(depth as i64);
        self.metrics.gauge("output.queue_depth", depth as i64);

        if self.workers == 0 {
            let workers = self.active_workers.load(Ordering::SeqCst);
            if depth > workers {
                // Ask for `depth` more; dropped when a request is already
                // pending, and the next write re-reacts.
                let _ = self.need_worker_tx.try_send(depth);
            }
        }

        data.len()
    }

    /// Spawns workers on demand. A fixed-size pool is provisioned once;
    /// a dynamic pool keeps serving spawn requests.
    async fn supervisor(self: Arc<Self>, mut need_worker: mpsc::Receiver<u64>) {
        while let Some(count) = need_worker.recv().await {
            for _ in 0..count {
                tokio::spawn(self.clone().worker_loop());
            }
            if self.workers != 0 {
                return;
            }
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        let client = match ReplayClient::new(&self.target, &self.client_config) {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "failed to build replay client, worker not started");
                return;
            }
        };
        let shadow = match &self.diff_host {
            Some(host) => match ReplayClient::new(host, &self.client_config) {
                Ok(client) => Some(client),
                Err(e) => {
                    error!(error = %e, "failed to build shadow client, worker not started");
                    return;
                }
            },
            None => None,
        };

        self.active_workers.fetch_add(1, Ordering::SeqCst);
        self.metrics.inc("output.worker_started");
        let mut death_count: u32 = 0;

        loop {
            match self.queue.pop_timeout(POLL_INTERVAL).await {
                Some(request) => {
                    death_count = 0;
                    self.send_request(&client, shadow.as_ref(), &request).await;
                }
                None => {
                    if self.workers != 0 {
                        continue;
                    }
                    death_count += 1;
                    if death_count > DEATH_COUNT_LIMIT && self.try_retire() {
                        self.metrics.inc("output.worker_retired");
                        return;
                    }
                }
            }
        }
    }

    /// Decrement the worker count unless this is the last worker; the pool
    /// never drops below one.
    fn try_retire(&self) -> bool {
        let mut current = self.active_workers.load(Ordering::SeqCst);
        while current > 1 {
            match self.active_workers.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    async fn send_request(
        &self,
        client: &ReplayClient,
        shadow: Option<&ReplayClient>,
        request: &[u8],
    ) {
        let start = Instant::now();
        let result = client.send(request).await;
        let rtt = start.elapsed();

        self.metrics.inc("output.request");
        self.metrics.timing("output.rtt", rtt);
        if let Err(e) = &result {
            warn!(error = %e, "request error");
            self.metrics.inc("output.request_error");
        }

        if let Some(observer) = &self.observer {
            observer.observe(request, result.as_ref().ok().map(|r| &r.raw[..]), rtt);
        }

        if let (Some(shadow), Some(reporter)) = (shadow, &self.diff) {
            reporter.analyze(shadow, request, &result, rtt).await;
        }
    }
}

impl std::fmt::Display for HttpOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP output: {}", self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Fixture server answering every connection with a canned 200.
    fn fixture_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut socket) = stream else { break };
                std::thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf);
                    let _ = socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
                });
            }
        });
        format!("127.0.0.1:{}", addr.port())
    }

    fn output_config(workers: u64) -> OutputConfig {
        OutputConfig {
            workers,
            timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    const REQ: &[u8] = b"GET /load HTTP/1.1\r\nHost: h\r\n\r\n";

    async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        predicate()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dynamic_pool_starts_with_initial_workers() {
        let addr = fixture_server();
        let output = HttpOutput::new(&addr, &output_config(0), Arc::new(Metrics::new())).unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || output.active_workers()
                == INITIAL_DYNAMIC_WORKERS)
            .await,
            "active workers: {}",
            output.active_workers()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fixed_pool_spawns_exactly_n() {
        let addr = fixture_server();
        let output = HttpOutput::new(&addr, &output_config(3), Arc::new(Metrics::new())).unwrap();

        assert!(wait_until(Duration::from_secs(2), || output.active_workers() == 3).await);

        // Fixed pools ignore idle timeouts
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(output.active_workers(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_write_reports_full_length() {
        let addr = fixture_server();
        let output = HttpOutput::new(&addr, &output_config(2), Arc::new(Metrics::new())).unwrap();

        let written = output.write(REQ).await;
        assert_eq!(written, REQ.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dynamic_pool_scales_up_and_retires_to_one() {
        let addr = fixture_server();
        let output = HttpOutput::new(&addr, &output_config(0), Arc::new(Metrics::new())).unwrap();

        wait_until(Duration::from_secs(2), || {
            output.active_workers() == INITIAL_DYNAMIC_WORKERS
        })
        .await;

        // Burst: deeper backlog than the initial pool triggers scale-up
        for _ in 0..60 {
            output.write(REQ).await;
        }
        assert!(
            wait_until(Duration::from_secs(3), || output.active_workers()
                > INITIAL_DYNAMIC_WORKERS)
            .await,
            "pool did not scale above {} (at {})",
            INITIAL_DYNAMIC_WORKERS,
            output.active_workers()
        );

        // After >2s of inactivity the pool shrinks back to a single worker
        assert!(
            wait_until(Duration::from_secs(15), || output.active_workers() == 1).await,
            "pool did not retire to 1 (at {})",
            output.active_workers()
        );

        // The minimum-of-one invariant holds from then on
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(output.active_workers(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queue_drains_to_workers() {
        let addr = fixture_server();
        let metrics = Arc::new(Metrics::new());
        let output = HttpOutput::new(&addr, &output_config(2), metrics.clone()).unwrap();

        for _ in 0..10 {
            output.write(REQ).await;
        }
        assert!(
            wait_until(Duration::from_secs(5), || metrics.counter("output.request") == 10).await,
            "only {} requests dispatched",
            metrics.counter("output.request")
        );
        assert_eq!(output.queue_depth(), 0);
    }
}
