//! Refract - Live HTTP Traffic Replicator
//!
//! Refract captures HTTP requests arriving at a production endpoint by
//! passive packet sniffing, optionally rewrites them, and replays them
//! against one or more secondary endpoints:
//!
//! - **Passive capture**: TCP streams are reassembled from raw packets into
//!   well-formed HTTP request/response pairs, correlated by flow identity
//! - **Adaptive replay**: a bounded queue drained by a worker pool that
//!   scales up under backpressure and retires idle workers
//! - **Differential analysis**: side-by-side comparison of a production
//!   response with a shadow response, with diverging requests persisted for
//!   offline study
//! - **Lossy by design**: under overload the capture path drops rather than
//!   blocks, keeping pace with the network over completeness
//!
//! # Quick Start
//!
//! ```no_run
//! use refract::{config, Replicator};
//!
//! #[tokio::main]
//! async fn main() -> refract::Result<()> {
//!     let config = config::load_config("refract.yaml")?;
//!     let replicator = Replicator::new(config)?;
//!     replicator.run().await
//! }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! input:
//!   listen: "eth0:80"
//!   capture_responses: true
//!
//! output:
//!   targets:
//!     - "http://staging.internal"
//!   workers: 0          # dynamic scaling
//!   diff:
//!     host: "http://canary.internal"
//!     requests_file: "/var/log/refract/diffs.bin"
//! ```

pub mod capture;
pub mod config;
pub mod diff;
pub mod error;
pub mod metrics;
pub mod modifier;
pub mod observer;
pub mod output;
pub mod proto;
pub mod replay;
pub mod server;
pub mod sink;
pub mod stats;

pub use config::Config;
pub use error::{RefractError, Result};
pub use server::Replicator;

/// Refract version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Refract name
pub const NAME: &str = env!("CARGO_PKG_NAME");
