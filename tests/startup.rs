//! Startup validation and connection robustness.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use veil_core::{Config, ConfigError, Frame};
use veil_crypto::{fingerprint_tag, open, Identity};
use veil_relay::socket::split;
use veil_relay::{Relay, RelayError};

#[test]
fn test_equal_ports_rejected_before_binding() {
    let config = Config {
        port: 4567,
        api_port: 4567,
        ..Config::default()
    };
    let err = match Relay::new(config, Identity::generate()) {
        Err(err) => err,
        Ok(_) => panic!("expected a configuration error"),
    };
    assert!(matches!(
        err,
        RelayError::Config(ConfigError::PortConflict(4567))
    ));
}

/// An unknown frame on a peer connection is dropped; the connection stays
/// open and later well-formed frames are handled normally.
#[tokio::test]
async fn test_unknown_frame_leaves_peer_connection_usable() {
    let config = Config {
        hostname: "127.0.0.1".to_string(),
        port: 0,
        api_port: 0,
        rps_addr: "127.0.0.1:9".to_string(),
        timeout_secs: 5,
        ..Config::default()
    };
    let relay = Relay::new(config, Identity::generate())
        .unwrap()
        .start()
        .await
        .unwrap();

    let us = Identity::generate();
    let mut raw = TcpStream::connect(relay.peer_addr()).await.unwrap();
    raw.write_all(&[0x00, 0x04, 0xFF, 0xFF]).await.unwrap();

    let (mut stream, sink) = split(raw, relay.peer_addr());
    sink.send(&Frame::Ping {
        tunnel_id: 4242,
        hostkey: us.hostkey(),
    })
    .await
    .unwrap();

    match stream
        .recv_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap()
    {
        Frame::Data {
            tunnel_id: 4242,
            hop_tag,
            payload,
        } => {
            assert_eq!(hop_tag, fingerprint_tag(&us.hostkey()));
            let inner = Frame::parse(&open(&payload, &us).unwrap()).unwrap();
            assert_eq!(
                inner,
                Frame::PingResponse {
                    tunnel_id: 4242,
                    hostkey: relay.hostkey(),
                }
            );
        }
        other => panic!("expected a sealed ping response, got {other:?}"),
    }

    // The ping created intermediate-side state with us as the previous hop.
    let tunnel = relay.table().lookup(4242).unwrap();
    assert!(tunnel.next.is_none());
    assert_eq!(tunnel.prev.unwrap().hostkey, Some(us.hostkey()));
}
