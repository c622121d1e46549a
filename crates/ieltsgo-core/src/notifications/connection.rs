//! Stream connection
//!
//! Opens the long-lived `text/event-stream` request and turns the body into
//! typed events. Cancellation is cooperative through a `CancellationToken`
//! and is reported as `StreamEnd::Cancelled`, never as a failure.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::sse::{decode_event, FrameParser};
use super::types::StreamEvent;
use crate::error::StreamError;

/// Raw response body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// Opens the event-stream request
///
/// `HttpTransport` is the real implementation; the hub only sees this trait.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, token: &str) -> Result<ByteStream, StreamError>;
}

/// Event stream over HTTP(S)
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, token: &str) -> Result<ByteStream, StreamError> {
        debug!("Opening notification stream at {}", self.url);
        let response = self
            .client
            .get(self.url.clone())
            .bearer_auth(token)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::Read(e.to_string())));
        Ok(Box::pin(body))
    }
}

/// How a stream run finished
#[derive(Debug)]
pub enum StreamEnd {
    /// Server closed the body cleanly
    Closed,
    /// The abort handle fired
    Cancelled,
    Failed(StreamError),
}

/// A single connection attempt
pub struct StreamConnection {
    transport: Arc<dyn StreamTransport>,
    cancel: CancellationToken,
}

impl StreamConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            cancel: CancellationToken::new(),
        }
    }

    /// Handle that stops the connection immediately, during open or read
    pub fn abort_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Issue the request and wait for response headers
    pub async fn open(self, token: &str) -> Result<OpenStream, StreamError> {
        let body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
            result = self.transport.open(token) => result?,
        };
        info!("Notification stream open");
        Ok(OpenStream {
            body,
            cancel: self.cancel,
        })
    }
}

/// A connected stream whose body is ready to be read
pub struct OpenStream {
    body: ByteStream,
    cancel: CancellationToken,
}

impl OpenStream {
    /// Read until the body ends, fails, or is cancelled
    ///
    /// Events are handed to `on_event` in wire order.
    pub async fn run<F>(mut self, mut on_event: F) -> StreamEnd
    where
        F: FnMut(StreamEvent),
    {
        let started = Instant::now();
        let mut parser = FrameParser::new();
        let mut events = 0usize;

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StreamEnd::Cancelled,
                next = self.body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    for frame in parser.push(&chunk) {
                        if let Some(event) = decode_event(&frame) {
                            events += 1;
                            on_event(event);
                        }
                    }
                }
                Some(Err(e)) => break StreamEnd::Failed(e),
                None => {
                    if let Some(event) = parser.finish().as_ref().and_then(decode_event) {
                        events += 1;
                        on_event(event);
                    }
                    break StreamEnd::Closed;
                }
            }
        };

        info!(
            "Notification stream ended ({:?}) after {:?}: {} events, {} frames, {} bytes",
            end,
            started.elapsed(),
            events,
            parser.frames_parsed(),
            parser.bytes_received()
        );
        end
    }
}
