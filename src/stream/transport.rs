//! Push transport abstraction and the HTTP Server-Sent Events implementation.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;

use crate::stream::proto::{RawMessage, SequenceId};
use crate::stream::sse::SseDecoder;

/// Query parameter carrying the resume cursor on table subscriptions.
pub const LAST_EVENT_ID_PARAM: &str = "lastEventId";

/// Live message feed of one subscription. Dropping it closes the transport.
pub type MessageStream = BoxStream<'static, Result<RawMessage, TransportError>>;

/// Errors that end a subscription.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP transport error.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered the subscription with a non-success status.
    #[error("http status {0}")]
    HttpStatus(StatusCode),

    /// Subscription did not open within the connect timeout.
    #[error("subscribe timed out after {0:?}")]
    Timeout(Duration),

    /// Server ended the stream.
    #[error("stream closed by server")]
    Closed,

    /// Failure reported by a custom transport.
    #[error("transport error: {0}")]
    Other(String),
}

/// Opens push subscriptions.
///
/// `cursor` is the highest sequence id already delivered; implementations
/// that support replay must only return events after it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn subscribe(&self, cursor: Option<SequenceId>) -> Result<MessageStream, TransportError>;
}

/// Server-Sent Events transport over `reqwest`.
#[derive(Clone, Debug)]
pub struct SseTransport {
    http: Client,
    url: Url,
    resumable: bool,
}

impl SseTransport {
    /// Creates a transport for `url`. Cursors are sent as `lastEventId`.
    pub fn new(http: Client, url: Url) -> Self {
        Self {
            http,
            url,
            resumable: true,
        }
    }

    /// Disables the `lastEventId` query parameter (lobby feed).
    pub fn without_resume(mut self) -> Self {
        self.resumable = false;
        self
    }

    pub fn request_url(&self, cursor: Option<SequenceId>) -> Url {
        let mut url = self.url.clone();
        if let (true, Some(cursor)) = (self.resumable, cursor) {
            url.query_pairs_mut()
                .append_pair(LAST_EVENT_ID_PARAM, &cursor.to_string());
        }
        url
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn subscribe(&self, cursor: Option<SequenceId>) -> Result<MessageStream, TransportError> {
        let response = self
            .http
            .get(self.request_url(cursor))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status));
        }

        Ok(sse_messages(Box::pin(response.bytes_stream())))
    }
}

/// Decodes a chunked byte stream into SSE messages.
///
/// A read error is yielded once and then the stream ends.
pub fn sse_messages<S>(bytes: S) -> MessageStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes, SseDecoder::new(), VecDeque::new(), false),
        |(mut bytes, mut decoder, mut ready, done)| async move {
            loop {
                if let Some(message) = ready.pop_front() {
                    return Some((Ok(message), (bytes, decoder, ready, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                    Some(Err(err)) => {
                        return Some((Err(TransportError::Http(err)), (bytes, decoder, ready, true)));
                    }
                    None => return None,
                }
            }
        },
    )
    .boxed()
}
