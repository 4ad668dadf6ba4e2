//! Per-request orchestration
//!
//! The inbound request target, minus its leading delimiter, is the absolute
//! URL to fetch (`GET /http://example.com/pkg/1.0/foo.json`). For each
//! request the handler:
//!
//! 1. derives the cache key, answering 400 if the target is unusable
//! 2. serves a committed cache entry if there is one, without contacting the origin
//! 3. otherwise forwards the request, echoes the origin status and headers,
//!    and streams the body to the client
//! 4. for a GET answered with exactly 200, tees every chunk into a staging
//!    file after it has been handed to the client, and publishes the entry
//!    once the whole body has been staged
//!
//! Cache failures and client disconnects abort the staging file and never
//! change what the client receives.

use crate::body::{self, BodySender, ProxyBody};
use crate::cache_key::{parse_target, CacheKey, KeyTransformer, PathKeyTransformer};
use crate::cache_store::{CacheStore, CacheWriter, CachedEntry, EntryHead};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::headers;
use crate::origin::{ChunkSource, Origin, OriginClient, OriginRequest, OriginResponse};
use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use reqwest::Url;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Read size when replaying a cache entry
const CACHE_READ_CHUNK: usize = 64 * 1024;

/// Marker header on responses served from the cache
pub const X_CACHE: &str = "x-cache";

/// Working state of one inbound request. Owned by the task serving it.
#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub method: Method,
    /// Request target as received, e.g. `/http://example.com/a`
    pub original_path: String,
    pub target: Url,
    pub key: CacheKey,
    pub headers: HeaderMap,
}

impl InFlightRequest {
    /// Cache entries are only written for GET
    fn is_cacheable(&self, status: StatusCode) -> bool {
        self.method == Method::GET && status == StatusCode::OK
    }
}

/// Cache-or-origin request handler
///
/// Holds only immutable collaborators; every piece of per-request state
/// lives in the task serving that request.
pub struct ProxyHandler {
    store: CacheStore,
    origin: Arc<dyn Origin>,
    keys: Arc<dyn KeyTransformer>,
}

impl ProxyHandler {
    pub fn new(store: CacheStore, origin: Arc<dyn Origin>, keys: Arc<dyn KeyTransformer>) -> Self {
        ProxyHandler {
            store,
            origin,
            keys,
        }
    }

    /// Build the default handler stack from configuration
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let store = CacheStore::new(config.cache_dir.clone(), config.persist_headers);
        let origin = OriginClient::new(config)?;
        let keys = PathKeyTransformer::new(config.session_segment.clone());
        Ok(Self::new(store, Arc::new(origin), Arc::new(keys)))
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Answer an inbound request. Never fails: errors become responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody> {
        let (parts, _) = req.into_parts();

        // Absolute-form targets (a client configured to use us as a forward
        // proxy) are already the URL to fetch.
        let target = if parts.uri.scheme().is_some() {
            parts.uri.to_string()
        } else {
            parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string())
        };

        self.serve(parts.method, &target, parts.headers).await
    }

    /// Answer `method target` with the given inbound headers.
    pub async fn serve(&self, method: Method, target: &str, headers: HeaderMap) -> Response<ProxyBody> {
        if method != Method::GET && method != Method::HEAD {
            debug!(method = %method, uri = target, "unsupported method");
            return text_response(
                StatusCode::NOT_IMPLEMENTED,
                format!("Unsupported method ({})", method),
            );
        }

        let request = match self.resolve(method, target, headers) {
            Ok(request) => request,
            Err(e) => {
                warn!(uri = target, error = %e, "rejecting request");
                return error_response(&e);
            }
        };

        match self.store.lookup(&request.key).await {
            Ok(Some(entry)) => {
                info!(method = %request.method, key = %request.key, "cache hit");
                return serve_hit(&request, entry);
            }
            Ok(None) => {
                info!(method = %request.method, key = %request.key, "cache miss");
            }
            Err(e) => {
                warn!(key = %request.key, error = %e, "cache lookup failed, fetching from origin");
            }
        }

        self.serve_miss(request).await
    }

    fn resolve(&self, method: Method, target: &str, headers: HeaderMap) -> Result<InFlightRequest> {
        let raw = target.trim_start_matches(['/', '?']);
        let url = parse_target(raw)?;
        let key = self.keys.transform(&url)?;
        Ok(InFlightRequest {
            method,
            original_path: target.to_string(),
            target: url,
            key,
            headers,
        })
    }

    async fn serve_miss(&self, request: InFlightRequest) -> Response<ProxyBody> {
        let origin_request = OriginRequest {
            method: request.method.clone(),
            url: request.target.clone(),
            headers: request.headers.clone(),
        };

        let origin = match self.origin.fetch(origin_request).await {
            Ok(origin) => origin,
            Err(e) => {
                warn!(path = %request.original_path, url = %request.target, error = %e, "origin fetch failed");
                return error_response(&e);
            }
        };

        if let Some(e) = origin.http_error() {
            info!(url = %request.target, error = %e, "relaying origin error status");
        }

        let OriginResponse {
            status,
            headers: origin_headers,
            body: source,
        } = origin;

        let writer = if request.is_cacheable(status) {
            let head = EntryHead::from_response(status, &origin_headers);
            match self.store.begin_write(&request.key, &head).await {
                Ok(writer) => Some(writer),
                Err(e) => {
                    warn!(key = %request.key, error = %e, "caching disabled for this response");
                    None
                }
            }
        } else {
            None
        };

        let (sender, body) = body::channel();
        tokio::spawn(relay(source, sender, writer, request.key.clone()));

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers::end_to_end(&origin_headers);
        response
    }
}

/// Copy the origin body to the client and, when `writer` is set, into the
/// staging file. Each chunk goes to the client first.
async fn relay(
    mut source: Box<dyn ChunkSource>,
    sender: BodySender,
    mut writer: Option<CacheWriter>,
    key: CacheKey,
) {
    let mut delivered: u64 = 0;

    loop {
        let chunk = match source.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                warn!(key = %key, bytes = delivered, error = %e, "origin stream ended early");
                if let Some(writer) = writer.take() {
                    writer.abort().await;
                }
                sender.send_error(e).await;
                return;
            }
        };

        if sender.send_data(chunk.clone()).await.is_err() {
            info!(key = %key, bytes = delivered, "client disconnected mid-transfer");
            if let Some(writer) = writer.take() {
                writer.abort().await;
            }
            return;
        }
        delivered += chunk.len() as u64;

        let failed = match writer.as_mut() {
            Some(writer) => writer.write(&chunk).await.err(),
            None => None,
        };
        if let Some(e) = failed {
            warn!(key = %key, error = %e, "cache write failed, continuing without caching");
            if let Some(writer) = writer.take() {
                writer.abort().await;
            }
        }
    }

    // The whole origin body was handed over; hyper may already have released
    // the client side after the final Content-Length byte.
    if let Some(writer) = writer {
        if let Err(e) = writer.commit().await {
            warn!(key = %key, error = %e, "cache commit failed");
        }
    }

    debug!(key = %key, bytes = delivered, "response relayed");
}

fn serve_hit(request: &InFlightRequest, entry: CachedEntry) -> Response<ProxyBody> {
    let head = entry
        .head
        .clone()
        .unwrap_or_else(|| EntryHead::generic(&request.key));

    let mut headers = head.header_map();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(entry.body_len));
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));

    let body = if request.method == Method::HEAD {
        body::empty()
    } else {
        let (sender, body) = body::channel();
        tokio::spawn(replay(entry.into_body(), sender, request.key.clone()));
        body
    };

    let mut response = Response::new(body);
    *response.status_mut() = head.status();
    *response.headers_mut() = headers;
    response
}

/// Stream a committed entry to the client in file order.
async fn replay(mut file: File, sender: BodySender, key: CacheKey) {
    let mut buf = BytesMut::with_capacity(CACHE_READ_CHUNK);
    loop {
        buf.reserve(CACHE_READ_CHUNK);
        match file.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk: Bytes = buf.split().freeze();
                if sender.send_data(chunk).await.is_err() {
                    debug!(key = %key, "client disconnected during cache replay");
                    return;
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed mid-replay");
                sender.send_error(e.into()).await;
                return;
            }
        }
    }
}

fn text_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    let mut response = Response::new(body::full(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    text_response(status, err.to_string())
}
