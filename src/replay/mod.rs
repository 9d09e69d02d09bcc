//! Replay client
//!
//! Sends a captured request's raw bytes to a target endpoint and returns the
//! full response, reserialized to wire form so downstream comparison can
//! work on bytes. Each worker owns its own client (and a second one for the
//! shadow target in diff mode).

use crate::error::{RefractError, Result};
use crate::proto;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_HEADERS: usize = 64;

/// Replay client configuration.
#[derive(Debug, Clone)]
pub struct ReplayHttpConfig {
    /// Maximum redirects followed per request; 0 never follows.
    pub redirect_limit: usize,
    /// Overall request/response deadline.
    pub timeout: Duration,
    /// Keep the captured `Host` header instead of the target's authority.
    pub preserve_host: bool,
    /// Log each send with inter-call timing.
    pub debug: bool,
}

impl Default for ReplayHttpConfig {
    fn default() -> Self {
        ReplayHttpConfig {
            redirect_limit: 0,
            timeout: DEFAULT_TIMEOUT,
            preserve_host: false,
            debug: false,
        }
    }
}

/// A replayed response in wire form.
#[derive(Debug, Clone)]
pub struct ReplayedResponse {
    /// Status line + headers + blank line + body.
    pub raw: Bytes,
    pub status: u16,
}

/// Outcome of one replay send.
pub type ReplayResult = Result<ReplayedResponse>;

/// True when the outcome counts as an error for diff classification: a
/// transport failure, or a response whose status line starts with `5`.
pub fn is_error(outcome: &ReplayResult) -> bool {
    match outcome {
        Err(_) => true,
        Ok(resp) => proto::status(&resp.raw).first() == Some(&b'5'),
    }
}

/// HTTP client bound to one replay target.
pub struct ReplayClient {
    base_url: String,
    client: reqwest::Client,
    config: ReplayHttpConfig,
    debug_log: DebugLog,
}

impl ReplayClient {
    /// Build a client for `target`, an authority like `staging.example.com`
    /// or a full `http://` / `https://` URL.
    pub fn new(target: &str, config: &ReplayHttpConfig) -> Result<Self> {
        let base_url = if target.starts_with("http://") || target.starts_with("https://") {
            target.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", target.trim_end_matches('/'))
        };

        let redirect = if config.redirect_limit == 0 {
            reqwest::redirect::Policy::none()
        } else {
            reqwest::redirect::Policy::limited(config.redirect_limit)
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(redirect)
            .build()?;

        Ok(ReplayClient {
            base_url,
            client,
            config: config.clone(),
            debug_log: DebugLog::new(),
        })
    }

    pub fn target(&self) -> &str {
        &self.base_url
    }

    /// Send raw captured request bytes to the target and collect the full
    /// response within the configured deadline.
    pub async fn send(&self, raw: &[u8]) -> ReplayResult {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let head_len = match parsed.parse(raw)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                return Err(RefractError::Replay("truncated request head".into()))
            }
        };

        let method = parsed
            .method
            .ok_or_else(|| RefractError::Replay("request without method".into()))?;
        let path = parsed
            .path
            .ok_or_else(|| RefractError::Replay("request without path".into()))?;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| RefractError::Replay(format!("invalid method: {}", e)))?;
        let url = format!("{}{}", self.base_url, path);

        let mut builder = self.client.request(method, &url);
        for h in parsed.headers.iter() {
            if skip_header(h.name) {
                continue;
            }
            if h.name.eq_ignore_ascii_case("host") && !self.config.preserve_host {
                // The Host header follows the replay target's authority.
                continue;
            }
            builder = builder.header(h.name, h.value);
        }

        let chunked = parsed.headers.iter().any(|h| {
            h.name.eq_ignore_ascii_case("transfer-encoding")
                && std::str::from_utf8(h.value)
                    .map(|v| v.to_ascii_lowercase().contains("chunked"))
                    .unwrap_or(false)
        });

        let body = &raw[head_len..];
        if !body.is_empty() {
            // Chunk framing belongs to the captured connection, not the
            // replayed one; the client re-frames the decoded body.
            let body = if chunked {
                decode_chunked(body).unwrap_or_else(|| body.to_vec())
            } else {
                body.to_vec()
            };
            builder = builder.body(body);
        }

        if self.config.debug {
            self.debug_log
                .log(format_args!("sending {} bytes to {}", raw.len(), self.base_url));
        }

        let response = builder.send().await?;
        let status = response.status();
        let version = version_str(response.version());

        let mut head = format!(
            "{} {} {}\r\n",
            version,
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .into_bytes();
        for (name, value) in response.headers() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        let body = response.bytes().await?;
        head.extend_from_slice(&body);

        if self.config.debug {
            self.debug_log
                .log(format_args!("received {} ({} bytes)", status, head.len()));
        }

        Ok(ReplayedResponse {
            raw: Bytes::from(head),
            status: status.as_u16(),
        })
    }
}

impl std::fmt::Display for ReplayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP output: {}", self.base_url)
    }
}

/// Strip chunked transfer framing, returning the bare body bytes.
fn decode_chunked(mut data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    loop {
        let line_end = data.windows(2).position(|w| w == b"\r\n")?;
        let size_token = data[..line_end].split(|&b| b == b';').next()?;
        let size = usize::from_str_radix(std::str::from_utf8(size_token).ok()?.trim(), 16).ok()?;
        data = &data[line_end + 2..];
        if size == 0 {
            return Some(out);
        }
        if data.len() < size + 2 {
            return None;
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size + 2..];
    }
}

/// Hop-by-hop headers never forwarded to the replay target.
fn skip_header(name: &str) -> bool {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-connection",
        "transfer-encoding",
        "upgrade",
        "content-length",
    ];
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn version_str(version: reqwest::Version) -> &'static str {
    if version == reqwest::Version::HTTP_10 {
        "HTTP/1.0"
    } else if version == reqwest::Version::HTTP_2 {
        "HTTP/2.0"
    } else if version == reqwest::Version::HTTP_3 {
        "HTTP/3.0"
    } else {
        "HTTP/1.1"
    }
}

/// Debug log with inter-call deltas; a mutex serializes computing the time
/// since the previous entry.
struct DebugLog {
    previous_nanos: Mutex<u64>,
}

impl DebugLog {
    fn new() -> Self {
        DebugLog {
            previous_nanos: Mutex::new(0),
        }
    }

    fn log(&self, args: std::fmt::Arguments<'_>) {
        let now = crate::capture::now_nanos();
        let delta_ms = {
            let mut previous = self.previous_nanos.lock();
            let delta = if *previous == 0 {
                0.0
            } else {
                now.saturating_sub(*previous) as f64 / 1_000_000.0
            };
            *previous = now;
            delta
        };
        debug!(delta_ms, "{}", args);
    }
}
