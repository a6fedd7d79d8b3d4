use std::io;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One side of a text-frame connection to the runtime.
///
/// The production implementation wraps a WebSocket; the adapter only depends
/// on this seam, so tests (and the in-process mock runtime) plug in a
/// channel-backed pair instead.
#[async_trait]
pub trait RdpTransport: Send + Sync {
    async fn send(&self, text: String) -> io::Result<()>;

    /// The next inbound frame, or `None` once the peer is gone.
    async fn recv(&self) -> io::Result<Option<String>>;

    fn close(&self);
}

/// In-memory duplex transport used by tests and the mock runtime.
pub struct PairTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
}

/// Two connected [`PairTransport`] halves.
pub fn pair() -> (PairTransport, PairTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    (
        PairTransport {
            tx: a_tx,
            rx: Mutex::new(a_rx),
            closed: closed.clone(),
        },
        PairTransport {
            tx: b_tx,
            rx: Mutex::new(b_rx),
            closed,
        },
    )
}

#[async_trait]
impl RdpTransport for PairTransport {
    async fn send(&self, text: String) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        self.tx
            .send(text)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer receiver dropped"))
    }

    async fn recv(&self) -> io::Result<Option<String>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            msg = rx.recv() => Ok(msg),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_frames_in_order() {
        let (a, b) = pair();
        a.send("one".to_string()).await.unwrap();
        a.send("two".to_string()).await.unwrap();
        assert_eq!(b.recv().await.unwrap().as_deref(), Some("one"));
        assert_eq!(b.recv().await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn close_unblocks_receiver() {
        let (a, b) = pair();
        let recv = tokio::spawn(async move { b.recv().await });
        a.close();
        assert_eq!(recv.await.unwrap().unwrap(), None);
    }
}
