//! Stream fetch loop.

use crate::error::{PlayerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

/// How a fetch loop finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The server closed the stream cleanly.
    Ended,
    /// Cancelled by the caller.
    Cancelled,
}

/// Receives byte ranges in the order they arrived.
#[async_trait]
pub trait ChunkSink: Send {
    async fn accept(&mut self, chunk: Bytes) -> Result<()>;
}

#[async_trait]
impl<B: crate::DecodeBuffer> ChunkSink for crate::BufferManager<B> {
    async fn accept(&mut self, chunk: Bytes) -> Result<()> {
        self.append(chunk).await
    }
}

/// One long-lived request to the segment stream endpoint.
#[derive(Debug, Clone)]
pub struct StreamFetch {
    client: reqwest::Client,
    url: String,
}

impl StreamFetch {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Read the stream incrementally and forward every chunk to `sink`.
    ///
    /// Cancellation drops the request and any pending `accept`; it is
    /// reported as [`FetchOutcome::Cancelled`], never as an error.
    pub async fn run<S: ChunkSink>(
        &self,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
            response = self.client.get(&self.url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(PlayerError::Status(status.as_u16()));
        }
        tracing::debug!(url = %self.url, "Stream opened");

        let mut body = response.bytes_stream();
        let mut received = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
                next = body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    if cancel.is_cancelled() {
                        return Ok(FetchOutcome::Cancelled);
                    }
                    return Err(e.into());
                }
                None => {
                    tracing::debug!(received, "Stream ended");
                    return Ok(FetchOutcome::Ended);
                }
            };
            received += chunk.len() as u64;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(FetchOutcome::Cancelled),
                accepted = sink.accept(chunk) => accepted?,
            }
        }
    }
}
