// In-memory duplex transport pair.
//
// Two endpoints joined by byte channels. Used by the crate's own tests and
// exported so downstream consumers can exercise the protocol engine
// without hardware. Closing either endpoint surfaces as a disconnect on
// the peer, the same way a pulled cable does on a real link.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use super::Transport;
use crate::error::TransportError;

pub struct LoopbackTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ceiling: Option<usize>,
}

impl LoopbackTransport {
    /// Create two connected endpoints.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            LoopbackTransport {
                tx: Some(a_tx),
                rx: b_rx,
                ceiling: None,
            },
            LoopbackTransport {
                tx: Some(b_tx),
                rx: a_rx,
                ceiling: None,
            },
        )
    }

    /// Simulate an MTU-limited link (selects the framed wire shape).
    pub fn with_payload_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = Some(ceiling);
        self
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::Io("transport closed".into()))?;
        tx.send(bytes.to_vec())
            .map_err(|_| TransportError::Disconnected("peer endpoint closed".into()))
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.tx.is_none() {
            return Err(TransportError::Io("transport closed".into()));
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(TransportError::Disconnected(
                "peer endpoint closed".into(),
            )),
            Err(_) => Ok(Vec::new()), // idle timeout
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the sender ends the peer's read stream
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    fn payload_ceiling(&self) -> Option<usize> {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_carries_bytes_both_ways() {
        let (mut a, mut b) = LoopbackTransport::pair();
        a.write(b"ping").await.unwrap();
        assert_eq!(b.read(Duration::from_millis(50)).await.unwrap(), b"ping");
        b.write(b"pong").await.unwrap();
        assert_eq!(a.read(Duration::from_millis(50)).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_idle_read_returns_empty_not_error() {
        let (mut a, _b) = LoopbackTransport::pair();
        let got = a.read(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_is_disconnect() {
        let (mut a, mut b) = LoopbackTransport::pair();
        b.close().await.unwrap();
        let err = a.read(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_disconnect());
        let err = a.write(b"x").await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut a, _b) = LoopbackTransport::pair();
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(!a.is_open());
    }
}
