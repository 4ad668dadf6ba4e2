//! Response bodies handed to hyper
//!
//! Static bodies (errors, HEAD) are `Full`/`Empty`. Streamed bodies are fed
//! through a bounded channel by a per-request task; when the client goes
//! away hyper drops the receiving side and the next send fails.

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Chunks buffered between the producing task and the client connection
const BODY_CHANNEL_CAPACITY: usize = 4;

/// Body type of every proxy response
pub type ProxyBody = BoxBody<Bytes, ProxyError>;

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Producer half of a streamed body
pub struct BodySender {
    tx: mpsc::Sender<std::result::Result<Frame<Bytes>, ProxyError>>,
}

impl BodySender {
    /// Queue a data chunk for the client.
    ///
    /// Fails with [`ProxyError::ClientDisconnect`] once the client side is gone.
    pub async fn send_data(&self, chunk: Bytes) -> Result<()> {
        self.tx
            .send(Ok(Frame::data(chunk)))
            .await
            .map_err(|_| ProxyError::ClientDisconnect)
    }

    /// Terminate the body with an error; hyper aborts the connection.
    pub async fn send_error(&self, err: ProxyError) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// Create a streamed body and the sender that feeds it.
///
/// The body ends when the sender is dropped.
pub fn channel() -> (BodySender, ProxyBody) {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let body = StreamBody::new(ReceiverStream::new(rx)).boxed();
    (BodySender { tx }, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_body_yields_chunks_in_order() {
        let (sender, body) = channel();
        tokio::spawn(async move {
            sender.send_data(Bytes::from_static(b"hello ")).await.unwrap();
            sender.send_data(Bytes::from_static(b"world")).await.unwrap();
        });

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_send_after_body_dropped_reports_disconnect() {
        let (sender, body) = channel();
        drop(body);
        assert!(matches!(
            sender.send_data(Bytes::from_static(b"x")).await,
            Err(ProxyError::ClientDisconnect)
        ));
    }

    #[tokio::test]
    async fn test_error_frame_fails_body() {
        let (sender, body) = channel();
        tokio::spawn(async move {
            sender.send_data(Bytes::from_static(b"part")).await.unwrap();
            sender
                .send_error(ProxyError::OriginUnavailable("reset".into()))
                .await;
        });

        assert!(body.collect().await.is_err());
    }
}
