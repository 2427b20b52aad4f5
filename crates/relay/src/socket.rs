//! Length-prefixed frame transport over TCP.
//!
//! The read half always consumes the length prefix first and then exactly
//! the declared number of bytes. Unknown and malformed frames are logged and
//! skipped without touching the connection; only a garbled length prefix is
//! fatal, because the stream cannot be resynchronized after one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use veil_core::{Frame, FrameError, HEADER_LEN};

use crate::{RelayError, Result};

/// Read half of a relay connection.
pub struct FrameStream {
    read: OwnedReadHalf,
    peer: SocketAddr,
}

/// Cloneable write half of a relay connection.
///
/// Cross-task forwarding writes through the shared lock, so a frame is never
/// interleaved with another task's frame on the same socket.
#[derive(Clone)]
pub struct FrameSink {
    write: Arc<Mutex<OwnedWriteHalf>>,
    peer: SocketAddr,
}

/// Split a connected stream into its two framed halves.
pub fn split(stream: TcpStream, peer: SocketAddr) -> (FrameStream, FrameSink) {
    let (read, write) = stream.into_split();
    (
        FrameStream { read, peer },
        FrameSink {
            write: Arc::new(Mutex::new(write)),
            peer,
        },
    )
}

/// Connect to `addr` within `timeout` and split the stream.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<(FrameStream, FrameSink)> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RelayError::Timeout)??;
    Ok(split(stream, addr))
}

impl FrameStream {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Receive the next well-formed frame, or `None` on a clean EOF.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            let mut prefix = [0u8; 2];
            match self.read.read_exact(&mut prefix).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }

            let declared = u16::from_be_bytes(prefix) as usize;
            if declared < HEADER_LEN {
                return Err(RelayError::Protocol("frame length shorter than its header"));
            }

            let mut buf = vec![0u8; declared];
            buf[..2].copy_from_slice(&prefix);
            self.read.read_exact(&mut buf[2..]).await?;

            match Frame::parse(&buf) {
                Ok(frame) => return Ok(Some(frame)),
                Err(FrameError::UnknownType(tag)) => {
                    warn!("Dropping frame with unknown type {} from {}", tag, self.peer);
                }
                Err(err) => {
                    warn!("Dropping malformed frame from {}: {}", self.peer, err);
                }
            }
        }
    }

    /// Like [`recv`](Self::recv), but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| RelayError::Timeout)?
    }
}

impl FrameSink {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Serialize and write one frame.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.to_bytes()?;
        let mut write = self.write.lock().await;
        write.write_all(&bytes).await?;
        Ok(())
    }

    /// Shut the write side down; the remote reader sees EOF.
    pub async fn close(&self) {
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }

    /// Whether two sinks refer to the same underlying connection.
    pub fn same_connection(&self, other: &FrameSink) -> bool {
        Arc::ptr_eq(&self.write, &other.write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use veil_core::Frame;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (client, server) = pair().await;
        let peer = client.peer_addr().unwrap();
        let (_, sink) = split(client, peer);
        let (mut stream, _) = split(server, peer);

        let frame = Frame::TunnelIncoming { tunnel_id: 99 };
        sink.send(&frame).await.unwrap();
        assert_eq!(stream.recv().await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn test_unknown_frame_is_skipped_connection_survives() {
        let (mut client, server) = pair().await;
        let peer = client.peer_addr().unwrap();
        let (mut stream, _) = split(server, peer);

        // Unknown tag 0xFFFF, then a well-formed frame on the same stream.
        client.write_all(&[0x00, 0x04, 0xFF, 0xFF]).await.unwrap();
        let good = Frame::NextHopQuery { tunnel_id: 5 };
        client.write_all(&good.to_bytes().unwrap()).await.unwrap();

        assert_eq!(stream.recv().await.unwrap(), Some(good));
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let (client, server) = pair().await;
        let peer = client.peer_addr().unwrap();
        let (mut stream, _) = split(server, peer);
        drop(client);
        assert_eq!(stream.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_timeout_fires() {
        let (_client, server) = pair().await;
        let peer = server.peer_addr().unwrap();
        let (mut stream, _) = split(server, peer);
        let err = stream
            .recv_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout));
    }

    #[tokio::test]
    async fn test_garbled_length_prefix_is_fatal() {
        let (mut client, server) = pair().await;
        let peer = client.peer_addr().unwrap();
        let (mut stream, _) = split(server, peer);

        client.write_all(&[0x00, 0x01]).await.unwrap();
        let err = stream.recv().await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
