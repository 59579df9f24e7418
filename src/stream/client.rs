//! Stream client: endpoint resolution and session construction.
//!
//! The client is cheap to clone and holds one shared `reqwest` connection
//! pool. Subscriptions are started with [`StreamClient::subscribe_table`] and
//! [`StreamClient::subscribe_lobby`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};
use thiserror::Error;

use crate::retry::BackoffPolicy;
use crate::stream::connection::ConnectionOptions;
use crate::stream::proto::EphemeralKinds;
use crate::stream::queue::{EventHandler, FailurePolicy};
use crate::stream::session::{LobbySession, SubscribeOptions, TableSession};
use crate::stream::transport::SseTransport;

/// Local development base URL.
pub const LOCAL_BASE_URL: &str = "http://localhost:8080";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(300);
}

/// Tuning shared by every session a client opens.
#[derive(Clone, Debug)]
pub struct StreamClientOptions {
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub ephemeral_kinds: EphemeralKinds,
    pub failure_policy: FailurePolicy,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            backoff: BackoffPolicy {
                initial_backoff: StreamDefaults::INITIAL_BACKOFF,
                max_backoff: StreamDefaults::MAX_BACKOFF,
                jitter: Duration::ZERO,
            },
            ephemeral_kinds: EphemeralKinds::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl StreamClientOptions {
    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            backoff: self.backoff.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Errors produced while configuring a client or subscription.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Base URL could not be parsed.
    #[error("invalid base url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Base URL cannot carry path segments (e.g. `mailto:`).
    #[error("base url cannot be used for stream endpoints: {0}")]
    UnsupportedUrl(String),

    /// HTTP client could not be built.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("table id must not be empty")]
    EmptyTableId,
}

/// Entry point for opening table and lobby streams.
#[derive(Clone, Debug)]
pub struct StreamClient {
    http: Client,
    base_url: Url,
    options: StreamClientOptions,
}

impl StreamClient {
    /// Creates a client for the server at `base_url` with default options.
    pub fn new(base_url: &str) -> Result<Self, StreamClientError> {
        Self::with_options(base_url, StreamClientOptions::default())
    }

    /// Creates a client for the local development server.
    pub fn local() -> Result<Self, StreamClientError> {
        Self::new(LOCAL_BASE_URL)
    }

    pub fn with_options(
        base_url: &str,
        options: StreamClientOptions,
    ) -> Result<Self, StreamClientError> {
        let base_url = Url::parse(base_url.trim_end())?;
        if base_url.cannot_be_a_base() {
            return Err(StreamClientError::UnsupportedUrl(base_url.to_string()));
        }

        // No overall request timeout: subscriptions are long-lived.
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            options,
        })
    }

    pub fn options(&self) -> &StreamClientOptions {
        &self.options
    }

    /// `{base}/api/tables/{table_id}/events`, without the cursor parameter.
    pub fn table_events_url(&self, table_id: &str) -> Result<Url, StreamClientError> {
        if table_id.trim().is_empty() {
            return Err(StreamClientError::EmptyTableId);
        }
        self.endpoint(&["api", "tables", table_id, "events"])
    }

    /// `{base}/lobby/events`.
    pub fn lobby_events_url(&self) -> Result<Url, StreamClientError> {
        self.endpoint(&["lobby", "events"])
    }

    /// Starts consuming a table stream.
    ///
    /// The session connects immediately when `options.enabled` is set.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_table(
        &self,
        options: SubscribeOptions,
        handler: impl EventHandler,
    ) -> Result<TableSession, StreamClientError> {
        let url = self.table_events_url(&options.table_id)?;
        let transport = SseTransport::new(self.http.clone(), url);
        Ok(TableSession::start(
            Arc::new(transport),
            options,
            Arc::new(handler),
            &self.options,
        ))
    }

    /// Starts consuming the lobby chat feed. Must be called from within a
    /// Tokio runtime.
    pub fn subscribe_lobby(
        &self,
        handler: impl EventHandler,
    ) -> Result<LobbySession, StreamClientError> {
        let url = self.lobby_events_url()?;
        let transport = SseTransport::new(self.http.clone(), url).without_resume();
        Ok(LobbySession::start(
            Arc::new(transport),
            Arc::new(handler),
            &self.options,
        ))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StreamClientError> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.path_segments_mut()
            .map_err(|()| StreamClientError::UnsupportedUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::{StreamClient, StreamClientError, LOCAL_BASE_URL};

    #[test]
    fn table_url_follows_endpoint_layout() {
        let client = StreamClient::new("https://poker.example").expect("client");
        let url = client.table_events_url("t-42").expect("url");
        assert_eq!(url.as_str(), "https://poker.example/api/tables/t-42/events");
    }

    #[test]
    fn base_path_and_trailing_slash_are_respected() {
        let client = StreamClient::new("https://poker.example/v2/  \n").expect("client");
        let url = client.table_events_url("t1").expect("url");
        assert_eq!(url.as_str(), "https://poker.example/v2/api/tables/t1/events");
    }

    #[test]
    fn table_id_is_percent_encoded() {
        let client = StreamClient::new("https://poker.example").expect("client");
        let url = client.table_events_url("high stakes/1").expect("url");
        assert_eq!(
            url.as_str(),
            "https://poker.example/api/tables/high%20stakes%2F1/events"
        );
    }

    #[test]
    fn empty_table_id_is_rejected() {
        let client = StreamClient::new("https://poker.example").expect("client");
        assert!(matches!(
            client.table_events_url("  "),
            Err(StreamClientError::EmptyTableId)
        ));
    }

    #[test]
    fn lobby_url_uses_local_base() {
        let client = StreamClient::local().expect("client");
        let url = client.lobby_events_url().expect("url");
        assert_eq!(url.as_str(), format!("{LOCAL_BASE_URL}/lobby/events"));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            StreamClient::new("not a url"),
            Err(StreamClientError::InvalidUrl(_))
        ));
        assert!(matches!(
            StreamClient::new("mailto:dealer@poker.example"),
            Err(StreamClientError::UnsupportedUrl(_))
        ));
    }
}
