//! Per-exchange response stream handed to the caller of
//! [`Client::exchange`](super::Client::exchange).

use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::ServerMessage;

/// Ordered stream of server messages belonging to one exchange.
///
/// The stream ends after the message matching the exchange's completion
/// predicate, or after a single terminal `Err` for fatal failures. Dropping
/// the stream early cancels the receiving side; the connection worker logs
/// the anomaly and keeps the queue moving.
pub struct ServerStream {
    rx: mpsc::Receiver<Result<ServerMessage>>,
}

impl ServerStream {
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<Result<ServerMessage>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    /// Next message of the exchange, or `None` once it completed.
    pub async fn next(&mut self) -> Option<Result<ServerMessage>> {
        self.rx.recv().await
    }

    /// Consume the rest of the stream, surfacing the first error if any.
    pub async fn drain(&mut self) -> Result<()> {
        while let Some(message) = self.next().await {
            message?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream").finish_non_exhaustive()
    }
}
