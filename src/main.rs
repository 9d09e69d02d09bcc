//! Refract - Live HTTP Traffic Replicator
//!
//! Captures production HTTP traffic off the wire and replays it against
//! staging or canary environments.

use clap::{Parser, Subcommand};
use refract::config::{self, Config, DiffConfig};
use refract::{Replicator, NAME, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Refract - Live HTTP Traffic Replicator
#[derive(Parser)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "Replay live production HTTP traffic against secondary endpoints")]
#[command(
    long_about = "Refract sniffs HTTP requests arriving at a production port, \
    optionally rewrites them, and replays them to one or more targets.\n\n\
    Typical usage:\n  \
    # Capture port 80 on eth0 and replay to staging\n  \
    refract --input-raw eth0:80 --output-http http://staging.internal\n\n  \
    # Side-by-side diffing against a canary\n  \
    refract --input-raw eth0:80 --output-http http://staging.internal \\\n      \
    --diff-host http://canary.internal --diff-requests-file diffs.bin"
)]
struct Cli {
    /// Configuration file path (YAML or TOML); flags override file values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture traffic from the given interface and port, e.g. "eth0:80"
    #[arg(long, value_name = "IFACE:PORT")]
    input_raw: Option<String>,

    /// Forward captured requests to this address (repeatable)
    #[arg(long, value_name = "URL")]
    output_http: Vec<String>,

    /// Fixed worker count per output; 0 enables dynamic scaling
    #[arg(long, alias = "output-http-workers")]
    workers: Option<u64>,

    /// Maximum redirects followed per replayed request
    #[arg(long, alias = "output-http-redirects")]
    redirect_limit: Option<usize>,

    /// Per-request timeout, e.g. "30s" (default 5s)
    #[arg(long, alias = "output-http-timeout", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Keep the captured Host header instead of the target's authority
    #[arg(long, alias = "http-original-host")]
    preserve_host: bool,

    /// Report queue-depth stats every 5 seconds
    #[arg(long, alias = "output-http-stats")]
    stats: bool,

    /// Log every replayed request with inter-call timing
    #[arg(long)]
    debug: bool,

    /// Capture responses too (enables RTT records)
    #[arg(long)]
    capture_responses: bool,

    /// Ship request/response analytics to ElasticSearch (host:port/index)
    #[arg(long, alias = "output-http-elasticsearch", value_name = "HOST:PORT/INDEX")]
    elastic_search: Option<String>,

    /// Shadow endpoint: replay each request there too and diff the responses
    #[arg(long, value_name = "URL")]
    diff_host: Option<String>,

    /// Persist diverging requests to this file
    #[arg(long, requires = "diff_host")]
    diff_requests_file: Option<PathBuf>,

    /// Suppress diffs when either side errored
    #[arg(long, requires = "diff_host")]
    diff_ignore_errors: bool,

    /// Whitelist of HTTP methods to replay (repeatable)
    #[arg(long, alias = "output-http-method", value_name = "METHOD")]
    http_allow_method: Vec<String>,

    /// Replay only requests whose URL matches this regex
    #[arg(long, alias = "output-http-url-regexp", value_name = "REGEX")]
    http_allow_url: Option<String>,

    /// Drop requests whose URL matches this regex
    #[arg(long, value_name = "REGEX")]
    http_disallow_url: Option<String>,

    /// Rewrite request URLs, e.g. "/v1/user/([^/]+)/ping:/v2/user/$1/ping"
    #[arg(long, alias = "output-http-rewrite-url", value_name = "PATTERN:REPLACEMENT")]
    http_rewrite_url: Vec<String>,

    /// Inject a header into replayed requests, e.g. "User-Agent: refract"
    #[arg(long, alias = "output-http-header", value_name = "NAME: VALUE")]
    http_set_header: Vec<String>,

    /// Set a URL param on replayed requests, e.g. "api_key=1"
    #[arg(long, value_name = "KEY=VALUE")]
    http_set_param: Vec<String>,

    /// Replay only requests whose named header matches, e.g. "api-version:^v1"
    #[arg(long, alias = "output-http-header-filter", value_name = "NAME:REGEX")]
    http_allow_header: Vec<String>,

    /// Drop requests whose named header matches
    #[arg(long, value_name = "NAME:REGEX")]
    http_disallow_header: Vec<String>,

    /// Consistently sample on a header hash, e.g. "user-id:25%"
    #[arg(long, alias = "output-http-header-hash-filter", value_name = "NAME:PERCENT%")]
    http_header_limiter: Vec<String>,

    /// Consistently sample on a URL param hash, e.g. "user_id:25%"
    #[arg(long, value_name = "NAME:PERCENT%")]
    http_param_limiter: Vec<String>,

    /// Ship metrics to a graphite aggregator (host:port)
    #[arg(long)]
    graphite: Option<String>,

    /// Prefix for shipped metric names
    #[arg(long, default_value = "refract")]
    graphite_prefix: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replicator
    Run,

    /// Validate configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> refract::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format);

    match cli.command {
        Some(Commands::Validate) => validate(&cli),
        Some(Commands::Run) | None => run(&cli).await,
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("refract={}", level)));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }
}

async fn run(cli: &Cli) -> refract::Result<()> {
    info!("Starting {} v{}", NAME, VERSION);

    let config = build_config(cli)?;
    let replicator = Replicator::new(config)?;
    replicator.run().await
}

fn validate(cli: &Cli) -> refract::Result<()> {
    match build_config(cli).and_then(|c| {
        config::validate_config(&c)?;
        Ok(c)
    }) {
        Ok(config) => {
            println!("\u{2713} Configuration is valid!");
            println!("\nSummary:");
            println!("  Capture: {}", config.input.listen);
            println!("  Targets: {}", config.output.targets.len());
            for target in &config.output.targets {
                println!("    - {}", target);
            }
            if let Some(diff) = &config.output.diff {
                println!("  Diff host: {}", diff.host);
            }
            Ok(())
        }
        Err(e) => {
            println!("\u{2717} Configuration is invalid!");
            println!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Start from the config file when given, then apply flag overrides.
fn build_config(cli: &Cli) -> refract::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    if let Some(listen) = &cli.input_raw {
        config.input.listen = listen.clone();
    }
    if cli.capture_responses {
        config.input.capture_responses = true;
    }
    // Diff timing in logs depends on captured RTTs
    if cli.diff_host.is_some() {
        config.input.capture_responses = true;
    }

    if !cli.output_http.is_empty() {
        config.output.targets = cli.output_http.clone();
    }
    if let Some(workers) = cli.workers {
        config.output.workers = workers;
    }
    if let Some(limit) = cli.redirect_limit {
        config.output.redirect_limit = limit;
    }
    if let Some(timeout) = cli.timeout {
        config.output.timeout = timeout;
    }
    if cli.preserve_host {
        config.output.preserve_host = true;
    }
    if cli.stats {
        config.output.stats = true;
    }
    if cli.debug {
        config.output.debug = true;
    }
    if cli.elastic_search.is_some() {
        config.output.elastic_search = cli.elastic_search.clone();
    }

    if let Some(host) = &cli.diff_host {
        config.output.diff = Some(DiffConfig {
            host: host.clone(),
            requests_file: cli.diff_requests_file.clone(),
            ignore_errors: cli.diff_ignore_errors,
        });
    }

    let modifier = &mut config.modifier;
    if !cli.http_allow_method.is_empty() {
        modifier.allow_methods = cli.http_allow_method.clone();
    }
    if cli.http_allow_url.is_some() {
        modifier.allow_url = cli.http_allow_url.clone();
    }
    if cli.http_disallow_url.is_some() {
        modifier.disallow_url = cli.http_disallow_url.clone();
    }
    if !cli.http_rewrite_url.is_empty() {
        modifier.rewrite_url = cli.http_rewrite_url.clone();
    }
    if !cli.http_set_header.is_empty() {
        modifier.set_headers = cli.http_set_header.clone();
    }
    if !cli.http_set_param.is_empty() {
        modifier.set_params = cli.http_set_param.clone();
    }
    if !cli.http_allow_header.is_empty() {
        modifier.allow_headers = cli.http_allow_header.clone();
    }
    if !cli.http_disallow_header.is_empty() {
        modifier.disallow_headers = cli.http_disallow_header.clone();
    }
    if !cli.http_header_limiter.is_empty() {
        modifier.header_limiters = cli.http_header_limiter.clone();
    }
    if !cli.http_param_limiter.is_empty() {
        modifier.param_limiters = cli.http_param_limiter.clone();
    }

    if cli.graphite.is_some() {
        config.metrics.graphite = cli.graphite.clone();
        config.metrics.graphite_prefix = cli.graphite_prefix.clone();
    }

    Ok(config)
}
