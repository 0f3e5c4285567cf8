//! Message transports between execution contexts.
//!
//! Two flavors:
//! - **Channel pairs**: in-process links used by the relay bridge and tests
//! - **Unix sockets**: the link to the privileged host process, framed with
//!   [`JsonCodec`](crate::codec::JsonCodec)
//!
//! Either way a [`Transport`] is the same thing to its owner: an outbound
//! sender, an ordered inbound queue, and a cancellation token that tears both
//! down. Disposal is idempotent; per-instance send order is preserved.

use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixStream, unix};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::JsonCodec;
use crate::error::{Error, Result};
use crate::protocol::WireMessage;

/// Cloneable handle for enqueuing outbound messages on a transport.
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<WireMessage>,
}

impl MessageSender {
    pub fn send(&self, msg: WireMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::TransportClosed)
    }
}

/// A bidirectional, message-oriented link to another context.
#[derive(Debug)]
pub struct Transport {
    pub(crate) sender: MessageSender,
    pub(crate) inbound: mpsc::UnboundedReceiver<WireMessage>,
    pub(crate) cancel: CancellationToken,
}

impl Transport {
    /// Create a cross-wired in-process pair. What one end sends, the other
    /// receives, in order.
    pub fn pair() -> (Transport, Transport) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let a = Transport {
            sender: MessageSender { tx: tx_ab },
            inbound: rx_ba,
            cancel: CancellationToken::new(),
        };
        let b = Transport {
            sender: MessageSender { tx: tx_ba },
            inbound: rx_ab,
            cancel: CancellationToken::new(),
        };
        (a, b)
    }

    /// Connect to the host process over a Unix socket.
    ///
    /// Fails with [`Error::HostUnavailable`] when nothing is listening.
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Transport> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Connecting to host socket");
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| Error::HostUnavailable {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_unix_stream(stream))
    }

    /// Wrap an established socket. Used by `connect_unix` on the client side
    /// and by the host's accept loop on the other.
    pub fn from_unix_stream(stream: UnixStream) -> Transport {
        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(read_half, in_tx, cancel.clone()));
        tokio::spawn(write_loop(write_half, out_rx, cancel.clone()));

        Transport {
            sender: MessageSender { tx: out_tx },
            inbound: in_rx,
            cancel,
        }
    }

    /// Cloneable outbound handle for this transport.
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    /// Release the underlying link. Idempotent; pending work held above this
    /// transport fails with [`Error::TransportClosed`].
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    read_half: unix::OwnedReadHalf,
    in_tx: mpsc::UnboundedSender<WireMessage>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(read_half, JsonCodec::<WireMessage>::new());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(msg)) => {
                    if in_tx.send(msg).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Transport decode error, closing");
                    break;
                }
                None => break,
            },
        }
    }
    // Reader gone means the link is gone for both directions.
    cancel.cancel();
}

async fn write_loop(
    write_half: unix::OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<WireMessage>,
    cancel: CancellationToken,
) {
    let mut frames = FramedWrite::new(write_half, JsonCodec::<WireMessage>::new());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = out_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = frames.send(msg).await {
                        tracing::warn!(error = %e, "Transport write error, closing");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    cancel.cancel();
}

/// Default host socket path: `$INFERLINK_SOCKET`, or `inferlink.sock` in the
/// system temp directory.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("INFERLINK_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("inferlink.sock"))
}

/// Probe whether a host is reachable. The probe connection is disposed
/// immediately after the check.
pub async fn host_available(path: impl AsRef<Path>) -> bool {
    match Transport::connect_unix(path).await {
        Ok(transport) => {
            transport.disconnect();
            true
        }
        Err(e) => {
            tracing::debug!(error = %e, "Host probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::protocol::RequestId;
    use serde_json::json;

    fn chunk(data: &str) -> WireMessage {
        WireMessage::Chunk {
            id: RequestId::new(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn pair_preserves_send_order() {
        let (a, mut b) = Transport::pair();
        a.sender.send(chunk("1")).unwrap();
        a.sender.send(chunk("2")).unwrap();
        a.sender.send(chunk("3")).unwrap();

        for expected in ["1", "2", "3"] {
            match b.inbound.recv().await.unwrap() {
                WireMessage::Chunk { data, .. } => assert_eq!(data, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (a, mut b) = Transport::pair();
        drop(a);
        assert!(b.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_fails_when_nothing_listens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let err = Transport::connect_unix(&path).await.unwrap_err();
        assert!(matches!(err, Error::HostUnavailable { .. }));
        assert!(!host_available(&path).await);
    }

    #[tokio::test]
    async fn probe_finds_listening_host() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("host.sock");
        let listener = tokio::net::UnixListener::bind(&path)?;
        let accept = tokio::spawn(async move { listener.accept().await });

        assert!(host_available(&path).await);
        accept.await??;
        Ok(())
    }

    #[tokio::test]
    async fn unix_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("host.sock");
        let listener = tokio::net::UnixListener::bind(&path)?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = Transport::from_unix_stream(stream);
            // Echo the request id back as a terminal message.
            let msg = transport.inbound.recv().await.unwrap();
            let WireMessage::Request { id, .. } = msg else {
                panic!("expected request");
            };
            transport
                .sender
                .send(WireMessage::Done {
                    id,
                    result: json!("ok"),
                })
                .unwrap();
        });

        let mut client = Transport::connect_unix(&path).await?;
        let id = RequestId::new();
        client.sender.send(WireMessage::Request {
            id,
            action: Action::GetModels,
        })?;

        match client.inbound.recv().await.unwrap() {
            WireMessage::Done {
                id: done_id,
                result,
            } => {
                assert_eq!(done_id, id);
                assert_eq!(result, json!("ok"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        server.await?;
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (a, _b) = Transport::pair();
        a.disconnect();
        a.disconnect();
        assert!(a.cancel.is_cancelled());
    }
}
