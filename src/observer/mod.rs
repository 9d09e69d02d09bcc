//! Asynchronous response observers
//!
//! The ElasticSearch observer ships one JSON document per replayed
//! request/response pair to a remote index. It is fire-and-forget: documents
//! are queued on a bounded channel and dropped when the indexer cannot keep
//! up, and indexing failures never propagate into the replay path.

use crate::error::{RefractError, Result};
use crate::proto;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queue capacity for documents awaiting indexing.
const QUEUE_CAPACITY: usize = 100;

const INDEX_TIMEOUT: Duration = Duration::from_secs(5);

/// One indexed request/response sample.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseDoc {
    pub method: String,
    pub path: String,
    /// Replay response status code; 0 when the send failed.
    pub status: u16,
    pub rtt_ms: u64,
    pub timestamp: chrono::DateTime<Utc>,
}

/// ElasticSearch response observer.
pub struct EsObserver {
    tx: mpsc::Sender<ResponseDoc>,
}

impl EsObserver {
    /// `endpoint` has the shape `host:port/index_name`.
    pub fn new(endpoint: &str) -> Result<Self> {
        let (host, index) = endpoint.split_once('/').ok_or_else(|| {
            RefractError::Config(format!(
                "elasticsearch endpoint must be host:port/index, got {:?}",
                endpoint
            ))
        })?;
        if host.is_empty() || index.is_empty() {
            return Err(RefractError::Config(
                "elasticsearch endpoint has an empty host or index".into(),
            ));
        }

        let url = format!("http://{}/{}/_doc", host, index);
        info!(url = %url, "response analytics shipping to elasticsearch");

        let client = reqwest::Client::builder().timeout(INDEX_TIMEOUT).build()?;
        let (tx, mut rx) = mpsc::channel::<ResponseDoc>(QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(doc) = rx.recv().await {
                match client.post(&url).json(&doc).send().await {
                    Ok(resp) if !resp.status().is_success() => {
                        warn!(status = %resp.status(), "elasticsearch rejected document");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "elasticsearch indexing failed"),
                }
            }
        });

        Ok(EsObserver { tx })
    }

    /// Queue one sample; drops when the indexer is backed up.
    pub fn observe(&self, req: &[u8], resp: Option<&[u8]>, rtt: Duration) {
        let doc = ResponseDoc {
            method: String::from_utf8_lossy(proto::method(req)).into_owned(),
            path: String::from_utf8_lossy(proto::path(req)).into_owned(),
            status: resp
                .and_then(|r| std::str::from_utf8(proto::status(r)).ok()?.parse().ok())
                .unwrap_or(0),
            rtt_ms: rtt.as_millis() as u64,
            timestamp: Utc::now(),
        };
        if self.tx.try_send(doc).is_err() {
            debug!("elasticsearch queue full, dropping sample");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_validation() {
        assert!(EsObserver::new("es.internal:9200/replays").is_ok());
        assert!(EsObserver::new("es.internal:9200").is_err());
        assert!(EsObserver::new("/index").is_err());
        assert!(EsObserver::new("host:9200/").is_err());
    }

    #[tokio::test]
    async fn test_observe_never_blocks() {
        let observer = EsObserver::new("127.0.0.1:1/replays").unwrap();
        let req = b"GET /a HTTP/1.1\r\n\r\n";
        let resp = b"HTTP/1.1 200 OK\r\n\r\n";
        for _ in 0..(QUEUE_CAPACITY * 2) {
            observer.observe(req, Some(&resp[..]), Duration::from_millis(1));
        }
    }
}
