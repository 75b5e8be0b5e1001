use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One unit of output toward the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// A complete non-streaming body, forwarded byte for byte.
    Body { status: StatusCode, body: Bytes },
    /// One stream record. `name` is empty when the record has no event name.
    Event { name: String, data: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("client connection closed")]
    ClientClosed,
}

/// Write side of the client connection.
#[async_trait]
pub trait ClientSink: Send {
    async fn forward(&mut self, frame: ClientFrame) -> Result<(), ForwardError>;

    /// Resolves once the client can no longer receive frames. Sinks that cannot
    /// observe a disconnect never resolve.
    async fn closed(&mut self) {
        futures_util::future::pending::<()>().await
    }
}

#[async_trait]
impl ClientSink for Vec<ClientFrame> {
    async fn forward(&mut self, frame: ClientFrame) -> Result<(), ForwardError> {
        self.push(frame);
        Ok(())
    }
}

/// The receiver is dropped once the client goes away, so a failed send is a disconnect.
#[async_trait]
impl ClientSink for mpsc::Sender<ClientFrame> {
    async fn forward(&mut self, frame: ClientFrame) -> Result<(), ForwardError> {
        self.send(frame)
            .await
            .map_err(|_| ForwardError::ClientClosed)
    }

    async fn closed(&mut self) {
        mpsc::Sender::closed(self).await
    }
}
