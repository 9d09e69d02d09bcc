//! Passive capture: live packet sniffing into captured HTTP messages
//!
//! A capture session opens a pcap handle on `iface:port`, filtered to TCP on
//! that port, and runs a blocking read loop on a dedicated thread. Packets
//! are sliced, reassembled per flow direction, and correlated into framed
//! request/response records. Flows idle for two minutes are flushed once a
//! minute.

mod assembler;
mod correlator;
mod flow;
mod http;
mod record;

pub use assembler::{Assembler, Delivery, Segment};
pub use correlator::{now_nanos, Correlator, OUTBOX_CAPACITY};
pub use flow::{fnv1a32, FlowKey};
pub use record::{CapturedMessage, RecordKind};

use crate::error::{RefractError, Result};
use crate::metrics::Metrics;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Snap length for live captures.
const SNAPLEN: i32 = 1600;

/// Read timeout so the flush ticker fires during quiet periods.
const READ_TIMEOUT_MS: i32 = 1000;

/// How often idle flows are flushed.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Flows (and pending requests) older than this are flushed.
const FLUSH_HORIZON: Duration = Duration::from_secs(120);

/// A live capture session emitting framed capture records.
pub struct CaptureSession {
    iface: String,
    port: u16,
    outbox: mpsc::Receiver<CapturedMessage>,
}

impl CaptureSession {
    /// Open a live capture on `"<iface>:<port>"`.
    ///
    /// Failure to open the capture source is fatal: the session cannot
    /// start. The packet loop runs on a dedicated thread until the source
    /// is exhausted.
    pub fn open(listen: &str, capture_responses: bool, metrics: Arc<Metrics>) -> Result<Self> {
        let (iface, port) = parse_listen(listen)?;

        let mut cap = pcap::Capture::from_device(iface.as_str())?
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .open()?;
        cap.filter(&format!("tcp and port {}", port), true)?;
        let link_type = cap.get_datalink();

        info!(iface = %iface, port, "starting pcap capture");

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let correlator = Correlator::new(port, capture_responses, outbox_tx, metrics.clone());

        let thread_iface = iface.clone();
        std::thread::Builder::new()
            .name("refract-capture".into())
            .spawn(move || {
                let mut driver = Driver {
                    assembler: Assembler::new(),
                    correlator,
                    metrics,
                    link_type,
                };
                driver.run(cap);
                debug!(iface = %thread_iface, "capture driver exited");
            })
            .map_err(|e| RefractError::Capture(format!("failed to spawn capture thread: {}", e)))?;

        Ok(CaptureSession {
            iface,
            port,
            outbox: outbox_rx,
        })
    }

    /// Receive the next captured message, bypassing the wire codec.
    pub async fn next_message(&mut self) -> Option<CapturedMessage> {
        self.outbox.recv().await
    }

    /// Read the next capture record into `buf` using the wire codec.
    ///
    /// Returns the total record length (header + newline + payload), or
    /// `None` once the capture source is exhausted. Records larger than the
    /// buffer are dropped.
    pub async fn read(&mut self, buf: &mut [u8]) -> Option<usize> {
        loop {
            let msg = self.outbox.recv().await?;
            match msg.encode_into(buf) {
                Some(n) => return Some(n),
                None => {
                    debug!(
                        needed = msg.encoded_len(),
                        available = buf.len(),
                        "capture record exceeds read buffer, dropping"
                    );
                }
            }
        }
    }
}

impl std::fmt::Display for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pcap input: {}:{}", self.iface, self.port)
    }
}

struct Driver {
    assembler: Assembler,
    correlator: Correlator,
    metrics: Arc<Metrics>,
    link_type: pcap::Linktype,
}

impl Driver {
    fn run(&mut self, mut cap: pcap::Capture<pcap::Active>) {
        let mut last_flush = now_nanos();
        let flush_interval = FLUSH_INTERVAL.as_nanos() as u64;

        loop {
            match cap.next_packet() {
                Ok(packet) => {
                    let ts = timeval_nanos(&packet.header.ts);
                    self.handle_packet(packet.data, ts);
                }
                Err(pcap::Error::TimeoutExpired) => {}
                Err(pcap::Error::NoMorePackets) => return,
                Err(e) => {
                    error!(error = %e, "capture read failed, stopping session");
                    return;
                }
            }

            let now = now_nanos();
            if now.saturating_sub(last_flush) >= flush_interval {
                self.flush(now);
                last_flush = now;
            }
        }
    }

    fn handle_packet(&mut self, data: &[u8], ts_nanos: u64) {
        let (key, segment) = match self.slice_packet(data) {
            Some(parts) => parts,
            None => {
                debug!("unusable packet");
                self.metrics.inc("capture.unusable_packet");
                return;
            }
        };

        let delivery = self.assembler.feed(key, segment, ts_nanos);
        if !delivery.data.is_empty() {
            self.correlator.on_data(key, &delivery.data);
        }
        if delivery.eof {
            self.correlator.on_eof(key);
        }
    }

    fn slice_packet<'a>(&self, data: &'a [u8]) -> Option<(FlowKey, Segment<'a>)> {
        let sliced = if self.link_type == pcap::Linktype::ETHERNET {
            SlicedPacket::from_ethernet(data).ok()?
        } else {
            SlicedPacket::from_ip(data).ok()?
        };

        let (src_ip, dst_ip): (IpAddr, IpAddr) = match sliced.net? {
            NetSlice::Ipv4(v4) => (
                v4.header().source_addr().into(),
                v4.header().destination_addr().into(),
            ),
            NetSlice::Ipv6(v6) => (
                v6.header().source_addr().into(),
                v6.header().destination_addr().into(),
            ),
            _ => return None,
        };

        let tcp = match sliced.transport? {
            TransportSlice::Tcp(tcp) => tcp,
            _ => return None,
        };

        let key = FlowKey {
            src_ip,
            dst_ip,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
        };
        let segment = Segment {
            seq: tcp.sequence_number(),
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            payload: tcp.payload(),
        };
        Some((key, segment))
    }

    fn flush(&mut self, now: u64) {
        let horizon = now.saturating_sub(FLUSH_HORIZON.as_nanos() as u64);
        for key in self.assembler.flush_older_than(horizon) {
            self.correlator.on_eof(key);
        }
        self.correlator.purge_pending(horizon);
        self.metrics
            .gauge("capture.pending_requests", self.correlator.pending_len() as i64);
        self.metrics
            .gauge("capture.active_streams", self.assembler.stream_count() as i64);
    }
}

fn parse_listen(listen: &str) -> Result<(String, u16)> {
    let (iface, port) = listen.rsplit_once(':').ok_or_else(|| {
        RefractError::Config(format!(
            "capture listen address must be iface:port, got {:?}",
            listen
        ))
    })?;
    if iface.is_empty() {
        return Err(RefractError::Config(
            "capture listen address has an empty interface".into(),
        ));
    }
    let port = port.parse().map_err(|_| {
        RefractError::Config(format!("invalid capture port {:?}", port))
    })?;
    Ok((iface.to_string(), port))
}

fn timeval_nanos(ts: &libc::timeval) -> u64 {
    let secs = ts.tv_sec.max(0) as u64;
    let micros = ts.tv_usec.max(0) as u64;
    secs * 1_000_000_000 + micros * 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen() {
        assert_eq!(parse_listen("eth0:8080").unwrap(), ("eth0".to_string(), 8080));
        assert_eq!(parse_listen("lo:80").unwrap(), ("lo".to_string(), 80));
    }

    #[test]
    fn test_parse_listen_rejects_bad_input() {
        assert!(parse_listen("eth0").is_err());
        assert!(parse_listen(":8080").is_err());
        assert!(parse_listen("eth0:notaport").is_err());
        assert!(parse_listen("eth0:70000").is_err());
    }
}
