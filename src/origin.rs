//! Origin client
//!
//! Issues the upstream request for a cache miss. Redirects are never
//! followed, idle connections are never pooled, and there is no retry: the
//! first answer the origin gives, whatever its status, is what the caller
//! gets.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::headers;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use tracing::{debug, warn};

/// Sequential source of body chunks
#[async_trait]
pub trait ChunkSource: Send {
    /// Next chunk, `Ok(None)` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.chunk()
            .await
            .map_err(|e| ProxyError::OriginUnavailable(format!("origin body failed: {}", e)))
    }
}

/// Request to forward upstream
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub url: Url,
    /// Inbound request headers; filtered before they leave the proxy
    pub headers: HeaderMap,
}

/// Status, headers, and a live body stream from the origin
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Box<dyn ChunkSource>,
}

impl OriginResponse {
    /// `OriginHttpError` for non-2xx answers. These are still relayed to
    /// the client verbatim; the error only classifies them.
    pub fn http_error(&self) -> Option<ProxyError> {
        if self.status.is_success() {
            None
        } else {
            Some(ProxyError::OriginHttpError {
                status: self.status.as_u16(),
            })
        }
    }
}

impl std::fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Anything that can answer an origin request
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse>;
}

/// HTTP origin client built on reqwest
#[derive(Debug, Clone)]
pub struct OriginClient {
    client: Client,
}

impl OriginClient {
    /// Build a client from the proxy configuration
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .pool_max_idle_per_host(0)
            .no_proxy();

        if let Some(timeout) = config.origin_timeout() {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = config.connect_timeout() {
            builder = builder.connect_timeout(timeout);
        }
        for (host, addr) in &config.origin_overrides {
            builder = builder.resolve(host, *addr);
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(OriginClient { client })
    }
}

#[async_trait]
impl Origin for OriginClient {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse> {
        let OriginRequest {
            method,
            url,
            headers: inbound,
        } = request;

        debug!(method = %method, url = %url, "fetching from origin");

        let response = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers::outbound_request(&inbound))
            .send()
            .await
            .map_err(|e| {
                warn!(method = %method, url = %url, error = %e, "origin request failed");
                ProxyError::OriginUnavailable(e.to_string())
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        debug!(url = %url, status = %status, "origin responded");

        Ok(OriginResponse {
            status,
            headers,
            body: Box::new(response),
        })
    }
}
