//! # Buyer HTTP Fetcher
//!
//! GET/POST against buyer endpoints with bounded timeouts and response size.
//! Loopback hosts and plain HTTP are only reachable under a developer
//! context, which debuggable audiences and updates carry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use thiserror::Error;
use url::{Host, Url};

use crate::config::FetcherConfig;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Developer-mode fetch semantics for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevContext {
    pub dev_options_enabled: bool,
}

impl DevContext {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn for_debuggable(is_debuggable: bool) -> Self {
        Self {
            dev_options_enabled: is_debuggable,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected HTTP status {status}")]
    HttpStatus { status: u16, body: String },
    #[error("response exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },
    #[error("URI '{uri}' is not allowed: {reason}")]
    DisallowedUri { uri: String, reason: &'static str },
    #[error("request cancelled")]
    Cancelled,
}

/// Coarse classification of a failed fetch, reported with scheduled updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailureKind {
    TooManyRequests,
    ServerError,
    Redirection,
    ClientError,
    ContentSize,
    Io,
    Unknown,
}

impl HttpFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpFailureKind::TooManyRequests => "too_many_requests",
            HttpFailureKind::ServerError => "server_error",
            HttpFailureKind::Redirection => "redirection",
            HttpFailureKind::ClientError => "client_error",
            HttpFailureKind::ContentSize => "content_size",
            HttpFailureKind::Io => "io",
            HttpFailureKind::Unknown => "unknown",
        }
    }
}

impl FetchError {
    pub fn failure_kind(&self) -> HttpFailureKind {
        match self {
            FetchError::HttpStatus { status: 429, .. } => HttpFailureKind::TooManyRequests,
            FetchError::HttpStatus { status, .. } if *status >= 500 => HttpFailureKind::ServerError,
            FetchError::HttpStatus { status, .. } if (300..400).contains(status) => {
                HttpFailureKind::Redirection
            }
            FetchError::HttpStatus { .. } => HttpFailureKind::ClientError,
            FetchError::ResponseTooLarge { .. } => HttpFailureKind::ContentSize,
            FetchError::Network(_) | FetchError::Timeout => HttpFailureKind::Io,
            FetchError::DisallowedUri { .. } | FetchError::Cancelled => HttpFailureKind::Unknown,
        }
    }

    /// Whether the failure happened on the wire rather than in local policy.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_)
                | FetchError::Timeout
                | FetchError::HttpStatus { .. }
                | FetchError::ResponseTooLarge { .. }
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(error.to_string())
        }
    }
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, uri: &str, dev: DevContext) -> Result<String, FetchError>;

    /// POSTs a JSON body; the response body is returned as text.
    async fn post(
        &self,
        uri: &str,
        body: &serde_json::Value,
        dev: DevContext,
    ) -> Result<String, FetchError>;
}

/// [`HttpFetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    max_response_size: usize,
}

impl ReqwestFetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout() + config.read_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("audience-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            max_response_size: config.max_response_size_bytes,
        })
    }

    pub fn with_timeout(timeout: Duration, max_response_size: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            max_response_size,
        })
    }

    async fn read_body(&self, mut response: reqwest::Response) -> Result<String, FetchError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        if response
            .content_length()
            .is_some_and(|len| len as usize > self.max_response_size)
        {
            return Err(FetchError::ResponseTooLarge {
                limit: self.max_response_size,
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_response_size {
                return Err(FetchError::ResponseTooLarge {
                    limit: self.max_response_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        String::from_utf8(body).map_err(|e| FetchError::Network(format!("invalid UTF-8 body: {e}")))
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, uri: &str, dev: DevContext) -> Result<String, FetchError> {
        let url = check_uri(uri, dev)?;
        let response = self
            .client
            .get(url)
            .header(ACCEPT, JSON_CONTENT_TYPE)
            .send()
            .await?;
        self.read_body(response).await
    }

    async fn post(
        &self,
        uri: &str,
        body: &serde_json::Value,
        dev: DevContext,
    ) -> Result<String, FetchError> {
        let url = check_uri(uri, dev)?;
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(ACCEPT, JSON_CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await?;
        self.read_body(response).await
    }
}

/// HTTPS to a public host, or anything HTTP(S) when developer options are on.
pub fn check_uri(uri: &str, dev: DevContext) -> Result<Url, FetchError> {
    let disallowed = |reason| FetchError::DisallowedUri {
        uri: uri.to_string(),
        reason,
    };

    let url = Url::parse(uri).map_err(|_| disallowed("not an absolute URI"))?;
    let host = url.host().ok_or_else(|| disallowed("missing host"))?;

    if dev.dev_options_enabled {
        return match url.scheme() {
            "http" | "https" => Ok(url),
            _ => Err(disallowed("unsupported scheme")),
        };
    }

    if url.scheme() != "https" {
        return Err(disallowed("HTTPS is required"));
    }

    let loopback = match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => ip.is_loopback(),
        Host::Ipv6(ip) => ip.is_loopback(),
    };
    if loopback {
        return Err(disallowed("loopback hosts require developer options"));
    }

    Ok(url)
}
