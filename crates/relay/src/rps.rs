//! Client for the random peer sampling service.
//!
//! One short-lived TCP connection per query. The peer's relay port is taken
//! from the port-map entry announcing the tunnel module; the leading port
//! field is the fallback.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use veil_core::{Frame, Peer, TUNNEL_MODULE};

use crate::socket;
use crate::{RelayError, Result};

/// Ask the sampling service at `rps_addr` for one random peer.
///
/// Every failure mode surfaces as a recoverable [`RelayError::PeerSource`];
/// callers must be prepared for absence.
pub async fn random_peer(rps_addr: &str, timeout: Duration) -> Result<Peer> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(rps_addr))
        .await
        .map_err(|_| RelayError::PeerSource(format!("connect to {rps_addr} timed out")))?
        .map_err(|e| RelayError::PeerSource(format!("connect to {rps_addr}: {e}")))?;
    let service_addr = stream
        .peer_addr()
        .map_err(|e| RelayError::PeerSource(e.to_string()))?;
    let (mut stream, sink) = socket::split(stream, service_addr);

    sink.send(&Frame::RpsQuery)
        .await
        .map_err(|e| RelayError::PeerSource(e.to_string()))?;

    let reply = stream
        .recv_timeout(timeout)
        .await
        .map_err(|e| RelayError::PeerSource(e.to_string()))?;

    match reply {
        Some(Frame::RpsPeer {
            port,
            port_map,
            addr,
            hostkey,
        }) => {
            let port = port_map
                .iter()
                .find(|mapping| mapping.module == TUNNEL_MODULE)
                .map(|mapping| mapping.port)
                .unwrap_or(port);
            let peer = Peer {
                addr: SocketAddr::new(addr, port),
                hostkey,
            };
            debug!("Sampled peer {} ({}..)", peer.addr, peer.hostkey.short());
            Ok(peer)
        }
        Some(other) => Err(RelayError::PeerSource(format!(
            "unexpected reply type {}",
            other.tag()
        ))),
        None => Err(RelayError::PeerSource(
            "connection closed before a peer arrived".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use tokio::net::TcpListener;

    use veil_core::{Hostkey, PortMapping};

    async fn rps_stub(reply: Option<Frame>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let (mut stream, sink) = socket::split(stream, peer);
            assert_eq!(stream.recv().await.unwrap(), Some(Frame::RpsQuery));
            if let Some(reply) = reply {
                sink.send(&reply).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_random_peer_prefers_tunnel_module_port() {
        let addr = rps_stub(Some(Frame::RpsPeer {
            port: 1000,
            port_map: vec![
                PortMapping {
                    module: 540,
                    port: 2000,
                },
                PortMapping {
                    module: TUNNEL_MODULE,
                    port: 3000,
                },
            ],
            addr: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            hostkey: Hostkey::new(vec![9; 32]),
        }))
        .await;

        let peer = random_peer(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(peer.addr, "10.1.2.3:3000".parse().unwrap());
        assert_eq!(peer.hostkey, Hostkey::new(vec![9; 32]));
    }

    #[tokio::test]
    async fn test_random_peer_falls_back_to_leading_port() {
        let addr = rps_stub(Some(Frame::RpsPeer {
            port: 1000,
            port_map: vec![],
            addr: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            hostkey: Hostkey::new(vec![9; 32]),
        }))
        .await;

        let peer = random_peer(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(peer.addr.port(), 1000);
    }

    #[tokio::test]
    async fn test_random_peer_surfaces_closed_service() {
        let addr = rps_stub(None).await;
        let err = random_peer(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PeerSource(_)));
    }

    #[tokio::test]
    async fn test_random_peer_rejects_wrong_reply() {
        let addr = rps_stub(Some(Frame::TunnelIncoming { tunnel_id: 1 })).await;
        let err = random_peer(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PeerSource(_)));
    }
}
