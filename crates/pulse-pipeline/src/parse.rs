//! Offloaded JSON parsing for large request bodies.
//!
//! Bodies at or above the threshold are decoded on tokio's blocking pool so
//! a multi-megabyte batch does not stall an I/O worker thread. A semaphore
//! caps how many such parses run at once.

use std::sync::Arc;

use bytes::Bytes;
use pulse_core::{PulseError, Result};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::debug;

/// Parser that moves large payloads off the async runtime.
#[derive(Debug, Clone)]
pub struct LargePayloadParser {
    permits: Arc<Semaphore>,
    threshold_bytes: usize,
}

impl LargePayloadParser {
    /// Creates a parser with `workers` concurrent blocking parses.
    pub fn new(workers: usize, threshold_bytes: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(workers.max(1))), threshold_bytes }
    }

    /// Size at which parsing is offloaded.
    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    /// Decodes `body` as JSON.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::Validation` for malformed JSON and
    /// `PulseError::Other` if the blocking task could not run.
    pub async fn parse<T>(&self, body: Bytes) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if body.len() < self.threshold_bytes {
            return decode(&body);
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| PulseError::Other(anyhow::anyhow!("parser pool closed: {e}")))?;

        debug!(bytes = body.len(), "parsing large payload on blocking pool");
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            decode(&body)
        })
        .await
        .map_err(|e| PulseError::Other(anyhow::anyhow!("parser task failed: {e}")))?
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| PulseError::validation(format!("malformed JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[tokio::test]
    async fn small_bodies_parse_inline() {
        let parser = LargePayloadParser::new(1, 1024);
        let value: Value = parser.parse(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn large_bodies_parse_on_blocking_pool() {
        let parser = LargePayloadParser::new(2, 16);
        let body = serde_json::to_vec(&vec![1u32; 1000]).unwrap();

        let value: Vec<u32> = parser.parse(Bytes::from(body)).await.unwrap();

        assert_eq!(value.len(), 1000);
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let parser = LargePayloadParser::new(1, 4);
        let err = parser.parse::<Value>(Bytes::from_static(b"{not json")).await.unwrap_err();
        assert_eq!(err.code(), "E1001");
    }
}
