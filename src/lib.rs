//! URL Cache Proxy
//!
//! A transparent HTTP caching proxy whose request path is the URL to fetch.
//! The first request for a resource goes to the origin; successful GET
//! responses are streamed to the client and written to a disk cache at the
//! same time, and later identical requests are answered from disk without
//! any network round-trip.
//!
//! # Overview
//!
//! ```text
//! GET /http://files.example.com/pkg/1.0/foo.json
//!         │
//!         ▼
//!   key: example.com/pkg/1.0/foo.json
//!         │
//!    ┌────┴─────┐ hit
//!    │  .cache/ ├──────► stream file to client
//!    └────┬─────┘
//!         │ miss
//!         ▼
//!      origin ──► client
//!               └► staging file ──rename──► .cache/example.com/pkg/1.0/foo.json
//! ```
//!
//! # Features
//!
//! - **Stable keys**: hosts collapse to their last two labels, ports and
//!   `/session/<token>` segments are dropped
//! - **Streaming tee**: bodies are never buffered whole; each chunk goes to
//!   the client, then to the staging file
//! - **Atomic publish**: entries appear under their final name only through
//!   a single rename, so truncated bodies are never served
//! - **Transparent errors**: redirects and error statuses from the origin
//!   are relayed as-is and never cached
//! - **Task per connection**: no in-memory state is shared between requests
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use url_cache_proxy::{ProxyConfig, ProxyServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::from_file("url_cache_proxy.yaml")?;
//! let server = ProxyServer::bind(&config).await?;
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "0.0.0.0:8088"
//! cache_dir: ".cache"
//! session_segment: "session"
//! persist_headers: true
//! origin_timeout_secs: 30
//! ```
//!
//! See [`ProxyConfig`] for every option.
//!
//! # Error Handling
//!
//! All fallible operations return [`ProxyError`]. Only `InvalidUrl` (400)
//! and `OriginUnavailable` (502) change the status a client sees; cache
//! write failures and client disconnects are absorbed where they happen.

pub mod body;
pub mod cache_key;
pub mod cache_store;
pub mod config;
pub mod error;
pub mod headers;
pub mod origin;
pub mod proxy;
pub mod server;

pub use cache_key::{parse_target, CacheKey, KeyTransformer, PathKeyTransformer};
pub use cache_store::{CacheStore, CacheWriter, CachedEntry, EntryHead};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use origin::{ChunkSource, Origin, OriginClient, OriginRequest, OriginResponse};
pub use proxy::{InFlightRequest, ProxyHandler};
pub use server::ProxyServer;
