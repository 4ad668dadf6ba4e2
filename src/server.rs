//! Connection host
//!
//! Accepts TCP connections and serves each one on its own task with a
//! hyper HTTP/1.1 connection. Tasks share the handler, which is immutable;
//! the cache directory is the only state that crosses requests.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::ProxyHandler;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Listening proxy server
pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Bind the configured listen address with the default handler stack
    pub async fn bind(config: &ProxyConfig) -> Result<Self> {
        let handler = ProxyHandler::from_config(config)?;
        Self::bind_with_handler(config.listen_addr()?, handler).await
    }

    /// Bind `addr` and serve requests with `handler`
    pub async fn bind_with_handler(addr: SocketAddr, handler: ProxyHandler) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ProxyError::ConfigError(format!("Failed to bind {}: {}", addr, e))
        })?;

        Ok(ProxyServer {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process is terminated
    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections already accepted run to completion.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!("Proxy listening on http://{}", addr);
        info!("Cache directory: {}", self.handler.store().root().display());

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "connection accepted");

                    let handler = Arc::clone(&self.handler);
                    tokio::task::spawn(async move {
                        let service = service_fn(move |req| {
                            let handler = Arc::clone(&handler);
                            async move { Ok::<_, Infallible>(handler.handle(req).await) }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            if err.is_incomplete_message() || err.is_closed() {
                                debug!(peer = %peer, error = %err, "client went away");
                            } else {
                                error!(peer = %peer, "Error serving connection: {:?}", err);
                            }
                        }
                    });
                }
            }
        }
    }
}
