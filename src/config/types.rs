//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Capture input configuration
    pub input: CaptureConfig,

    /// Replay output configuration
    pub output: OutputConfig,

    /// Request modifier configuration
    #[serde(default)]
    pub modifier: ModifierConfig,

    /// Metrics reporting configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Capture input configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    /// Capture source as `iface:port`, e.g. "eth0:80"
    pub listen: String,

    /// Also capture and emit response records (required for RTT timing)
    #[serde(default)]
    pub capture_responses: bool,
}

/// Replay output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    /// Replay target endpoints; each gets its own worker pool
    #[serde(default)]
    pub targets: Vec<String>,

    /// Fixed worker count; 0 enables dynamic scaling
    #[serde(default)]
    pub workers: u64,

    /// Maximum redirects followed per replayed request; 0 never follows
    #[serde(default)]
    pub redirect_limit: usize,

    /// Per-request deadline
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Keep the captured Host header instead of rewriting it to the target
    #[serde(default)]
    pub preserve_host: bool,

    /// Report queue-depth stats every five seconds
    #[serde(default)]
    pub stats: bool,

    /// Log every replayed request with inter-call timing
    #[serde(default)]
    pub debug: bool,

    /// ElasticSearch analytics endpoint as `host:port/index`
    #[serde(default)]
    pub elastic_search: Option<String>,

    /// Differential analyzer configuration
    #[serde(default)]
    pub diff: Option<DiffConfig>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            targets: Vec::new(),
            workers: 0,
            redirect_limit: 0,
            timeout: default_timeout(),
            preserve_host: false,
            stats: false,
            debug: false,
            elastic_search: None,
            diff: None,
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Differential analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiffConfig {
    /// Shadow endpoint receiving a duplicate of each replayed request
    pub host: String,

    /// Sink file for diverging requests
    #[serde(default)]
    pub requests_file: Option<PathBuf>,

    /// Suppress diffs when either side errored
    #[serde(default)]
    pub ignore_errors: bool,
}

/// Request modifier configuration; all filters are optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModifierConfig {
    /// Whitelist of HTTP methods to replay; anything else is dropped
    #[serde(default)]
    pub allow_methods: Vec<String>,

    /// Drop requests whose URL does not match this regex
    #[serde(default)]
    pub allow_url: Option<String>,

    /// Drop requests whose URL matches this regex
    #[serde(default)]
    pub disallow_url: Option<String>,

    /// URL rewrite rules as `pattern:replacement`
    #[serde(default)]
    pub rewrite_url: Vec<String>,

    /// Headers to inject as `Name: value`
    #[serde(default)]
    pub set_headers: Vec<String>,

    /// URL params to set as `key=value`
    #[serde(default)]
    pub set_params: Vec<String>,

    /// Keep only requests whose named header matches, as `name:regex`
    #[serde(default)]
    pub allow_headers: Vec<String>,

    /// Drop requests whose named header matches, as `name:regex`
    #[serde(default)]
    pub disallow_headers: Vec<String>,

    /// Consistent sampling on a header value, as `name:percent%`
    #[serde(default)]
    pub header_limiters: Vec<String>,

    /// Consistent sampling on a URL param value, as `name:percent%`
    #[serde(default)]
    pub param_limiters: Vec<String>,
}

/// Metrics reporting configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Graphite-style plaintext aggregator as `host:port`
    #[serde(default)]
    pub graphite: Option<String>,

    /// Prefix prepended to every shipped metric name
    #[serde(default)]
    pub graphite_prefix: String,

    /// Log metric snapshots locally once a minute
    #[serde(default)]
    pub log_samples: bool,
}
