//! TCP stream reassembly
//!
//! Groups segments by flow direction, reorders them by sequence number, and
//! hands contiguous byte runs to the correlator. State is owned by the
//! capture driver; there is no cross-task sharing.

use super::flow::FlowKey;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Upper bound on buffered out-of-order bytes per direction. A stream with a
/// hole that never fills would otherwise grow without limit.
const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// One TCP segment as seen by the assembler.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
}

/// Contiguous data (possibly empty) released by one segment, plus whether
/// the direction reached end-of-stream.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub data: Vec<u8>,
    pub eof: bool,
}

struct StreamState {
    /// Next expected sequence number; None until the first segment arrives.
    next_seq: Option<u32>,
    /// Out-of-order segments keyed by sequence number.
    pending: BTreeMap<u32, Vec<u8>>,
    pending_bytes: usize,
    /// Sequence number one past the last byte, once FIN is seen.
    fin_seq: Option<u32>,
    last_activity: u64,
}

impl StreamState {
    fn new(ts: u64) -> Self {
        StreamState {
            next_seq: None,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            fin_seq: None,
            last_activity: ts,
        }
    }
}

/// Per-direction TCP reassembler.
pub struct Assembler {
    streams: HashMap<FlowKey, StreamState>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            streams: HashMap::new(),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Feed one segment; returns any newly contiguous bytes for this
    /// direction and whether the stream ended (FIN reached or RST).
    pub fn feed(&mut self, key: FlowKey, seg: Segment<'_>, ts_nanos: u64) -> Delivery {
        let state = self
            .streams
            .entry(key)
            .or_insert_with(|| StreamState::new(ts_nanos));
        state.last_activity = ts_nanos;

        if seg.rst {
            self.streams.remove(&key);
            return Delivery {
                data: Vec::new(),
                eof: true,
            };
        }

        if seg.syn {
            // SYN occupies one sequence number; data starts past it.
            state.next_seq = Some(seg.seq.wrapping_add(1));
        } else if state.next_seq.is_none() {
            // Joined mid-stream: adopt this segment's position.
            state.next_seq = Some(seg.seq);
        }

        if seg.fin {
            state.fin_seq = Some(seg.seq.wrapping_add(seg.payload.len() as u32));
        }

        if !seg.payload.is_empty() {
            Self::buffer_segment(state, seg.seq, seg.payload);
        }

        let mut delivery = Delivery::default();
        Self::drain_contiguous(state, &mut delivery);

        if delivery.eof {
            self.streams.remove(&key);
        }
        delivery
    }

    /// Drop flows with no activity since `horizon_nanos`, returning their
    /// keys so handlers can observe end-of-stream.
    pub fn flush_older_than(&mut self, horizon_nanos: u64) -> Vec<FlowKey> {
        let stale: Vec<FlowKey> = self
            .streams
            .iter()
            .filter(|(_, s)| s.last_activity < horizon_nanos)
            .map(|(k, _)| *k)
            .collect();
        for key in &stale {
            trace!(flow = %key, "flushing idle stream");
            self.streams.remove(key);
        }
        stale
    }

    fn buffer_segment(state: &mut StreamState, seq: u32, payload: &[u8]) {
        let next = match state.next_seq {
            Some(n) => n,
            None => return,
        };

        // Trim bytes the stream already consumed (retransmit / overlap).
        let lag = next.wrapping_sub(seq);
        let (seq, payload) = if (lag as i32) > 0 {
            if (lag as usize) >= payload.len() {
                return;
            }
            (next, &payload[lag as usize..])
        } else {
            (seq, payload)
        };

        if state.pending_bytes + payload.len() > MAX_PENDING_BYTES {
            trace!("dropping segment: pending buffer full");
            return;
        }
        if let Some(prev) = state.pending.insert(seq, payload.to_vec()) {
            state.pending_bytes -= prev.len();
        }
        state.pending_bytes += payload.len();
    }

    fn drain_contiguous(state: &mut StreamState, out: &mut Delivery) {
        loop {
            let next = match state.next_seq {
                Some(n) => n,
                None => return,
            };

            if state.fin_seq == Some(next) {
                out.eof = true;
                return;
            }

            if let Some(data) = state.pending.remove(&next) {
                state.pending_bytes -= data.len();
                state.next_seq = Some(next.wrapping_add(data.len() as u32));
                out.data.extend_from_slice(&data);
                continue;
            }

            // A buffered segment may now start inside the consumed region
            // (late retransmit); re-trim it against the new position.
            let overlapping = state.pending.keys().copied().find(|&s| {
                let lag = next.wrapping_sub(s);
                lag as i32 > 0
            });
            let seq = match overlapping {
                Some(s) => s,
                None => return,
            };
            if let Some(data) = state.pending.remove(&seq) {
                state.pending_bytes -= data.len();
                let lag = next.wrapping_sub(seq) as usize;
                if lag < data.len() {
                    let tail = data[lag..].to_vec();
                    state.pending_bytes += tail.len();
                    state.pending.insert(next, tail);
                }
            }
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}
