//! Flow correlation and captured-message emission
//!
//! For each flow direction the correlator keeps a stream handler: incoming
//! streams parse requests, outgoing streams parse responses, everything else
//! is drained and discarded. Request timestamps live in a pending table so
//! the matching response can be stamped with its measured RTT.
//!
//! The emitter outbox is bounded; when the consumer falls behind, further
//! messages are dropped silently. Capture must never block the reassembler.

use super::flow::FlowKey;
use super::http::{self, Parsed};
use super::record::{CapturedMessage, RecordKind};
use crate::metrics::Metrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbox capacity; overflow is dropped, not blocked on.
pub const OUTBOX_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Incoming,
    Outgoing,
    Discard,
}

struct StreamHandler {
    kind: HandlerKind,
    stream_id: u64,
    /// Per-stream message counter; the n-th message gets id stream_id + n.
    count: u64,
    buf: Vec<u8>,
}

/// Correlates flow directions into captured request/response messages.
///
/// Owned by the capture driver; all state is single-task.
pub struct Correlator {
    listen_port: u16,
    capture_responses: bool,
    handlers: HashMap<FlowKey, StreamHandler>,
    /// Captured-request id -> capture timestamp (ns), consumed by the
    /// matching response.
    pending: HashMap<u64, u64>,
    outbox: mpsc::Sender<CapturedMessage>,
    metrics: Arc<Metrics>,
}

impl Correlator {
    pub fn new(
        listen_port: u16,
        capture_responses: bool,
        outbox: mpsc::Sender<CapturedMessage>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Correlator {
            listen_port,
            capture_responses,
            handlers: HashMap::new(),
            pending: HashMap::new(),
            outbox,
            metrics,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed newly contiguous stream bytes for one flow direction.
    pub fn on_data(&mut self, key: FlowKey, data: &[u8]) {
        let capture_responses = self.capture_responses;
        let listen_port = self.listen_port;
        let handler = self.handlers.entry(key).or_insert_with(|| {
            let kind = if key.is_incoming(listen_port) {
                HandlerKind::Incoming
            } else if capture_responses {
                HandlerKind::Outgoing
            } else {
                HandlerKind::Discard
            };
            StreamHandler {
                kind,
                stream_id: key.stream_hash(),
                count: 0,
                buf: Vec::new(),
            }
        });

        if handler.kind == HandlerKind::Discard {
            return;
        }

        handler.buf.extend_from_slice(data);
        self.drain(key, false);
    }

    /// The flow direction ended (FIN, RST, or idle flush).
    pub fn on_eof(&mut self, key: FlowKey) {
        if self
            .handlers
            .get(&key)
            .map(|h| h.kind == HandlerKind::Outgoing)
            .unwrap_or(false)
        {
            // Responses framed by connection close become complete now.
            self.drain(key, true);
        }
        self.handlers.remove(&key);
    }

    /// Purge pending requests captured before `horizon_nanos`.
    pub fn purge_pending(&mut self, horizon_nanos: u64) {
        let before = self.pending.len();
        self.pending.retain(|_, &mut ts| ts >= horizon_nanos);
        let purged = before - self.pending.len();
        if purged > 0 {
            debug!(purged, "purged pending requests past flush horizon");
            for _ in 0..purged {
                self.metrics.inc("capture.pending_purged");
            }
        }
    }

    fn drain(&mut self, key: FlowKey, eof: bool) {
        loop {
            let handler = match self.handlers.get_mut(&key) {
                Some(h) => h,
                None => return,
            };
            if handler.buf.is_empty() {
                return;
            }

            let parsed = match handler.kind {
                HandlerKind::Incoming => http::parse_request(&handler.buf),
                HandlerKind::Outgoing => http::parse_response(&handler.buf, eof),
                HandlerKind::Discard => return,
            };

            match parsed {
                Ok(Parsed::Complete { consumed }) => {
                    handler.count += 1;
                    let id = handler.stream_id.wrapping_add(handler.count);
                    let payload: Vec<u8> = handler.buf.drain(..consumed).collect();
                    let kind = handler.kind;
                    self.emit_message(kind, id, payload);
                }
                Ok(Parsed::NeedMore) => return,
                Err(e) => {
                    // Drop to the next parseable boundary and keep going.
                    warn!(flow = %key, error = %e, "discarding unparseable stream bytes");
                    self.metrics.inc("capture.parse_error");
                    handler.buf.clear();
                    return;
                }
            }
        }
    }

    fn emit_message(&mut self, kind: HandlerKind, id: u64, payload: Vec<u8>) {
        let now = now_nanos();
        let msg = match kind {
            HandlerKind::Incoming => {
                self.pending.insert(id, now);
                self.metrics.inc("capture.request");
                CapturedMessage {
                    kind: RecordKind::Request,
                    id,
                    timing: now,
                    payload,
                }
            }
            HandlerKind::Outgoing => {
                let started = match self.pending.remove(&id) {
                    Some(ts) => ts,
                    None => {
                        debug!(id, "response to missing request");
                        self.metrics.inc("capture.orphan_response");
                        return;
                    }
                };
                self.metrics.inc("capture.response");
                CapturedMessage {
                    kind: RecordKind::Response,
                    id,
                    timing: now.saturating_sub(started),
                    payload,
                }
            }
            HandlerKind::Discard => return,
        };

        if self.outbox.try_send(msg).is_err() {
            // Deliberately lossy under overload.
            self.metrics.inc("capture.outbox_drop");
        }
    }
}

/// Wall-clock nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
