//! Pipeline wiring
//!
//! The replicator connects a capture session to one worker pool per replay
//! target: capture records are decoded, request payloads pass through the
//! modifier, and surviving requests fan out to every output queue. Shutdown
//! is cooperative; in-flight requests may be abandoned.

use crate::capture::{CaptureSession, CapturedMessage, RecordKind};
use crate::config::{validate_config, Config};
use crate::error::Result;
use crate::metrics::{spawn_reporter, Metrics, ReporterConfig};
use crate::modifier::RequestModifier;
use crate::output::HttpOutput;
use std::sync::Arc;
use tracing::{info, warn};

/// Largest capture record the pipeline will carry.
const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// The traffic replicator: capture, modify, replay.
pub struct Replicator {
    config: Config,
    metrics: Arc<Metrics>,
}

impl Replicator {
    /// Validate the configuration and prepare the replicator.
    pub fn new(config: Config) -> Result<Self> {
        validate_config(&config)?;
        Ok(Replicator {
            config,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run the pipeline until the capture source is exhausted or ctrl-c.
    pub async fn run(self) -> Result<()> {
        spawn_reporter(
            self.metrics.clone(),
            ReporterConfig {
                graphite: self.config.metrics.graphite.clone(),
                graphite_prefix: self.config.metrics.graphite_prefix.clone(),
                log_samples: self.config.metrics.log_samples,
            },
        );

        let modifier = RequestModifier::new(&self.config.modifier)?;

        let mut outputs = Vec::with_capacity(self.config.output.targets.len());
        for target in &self.config.output.targets {
            outputs.push(HttpOutput::new(
                target,
                &self.config.output,
                self.metrics.clone(),
            )?);
        }

        // Response capture is only useful with a consumer for response
        // records; RTT timing in diff logs also depends on it.
        let mut capture = CaptureSession::open(
            &self.config.input.listen,
            self.config.input.capture_responses,
            self.metrics.clone(),
        )?;
        info!("replicating {} -> {} target(s)", capture, outputs.len());

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut buf = vec![0u8; MAX_RECORD_BYTES];
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("interrupt received, shutting down");
                    return Ok(());
                }
                read = capture.read(&mut buf) => {
                    match read {
                        Some(n) => self.dispatch(&buf[..n], &modifier, &outputs).await,
                        None => {
                            info!("capture source exhausted");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Decode one capture record and fan requests out to every output.
    async fn dispatch(
        &self,
        frame: &[u8],
        modifier: &RequestModifier,
        outputs: &[Arc<HttpOutput>],
    ) {
        let msg = match CapturedMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping undecodable capture record");
                return;
            }
        };

        // Only requests are replayed; response records exist for timing and
        // analysis sinks.
        if msg.kind != RecordKind::Request {
            return;
        }

        let payload = match modifier.apply(&msg.payload) {
            Some(payload) => payload,
            None => {
                self.metrics.inc("modifier.dropped");
                return;
            }
        };

        for output in outputs {
            output.write(&payload).await;
        }
    }
}
