//! The relay value and its two listeners.
//!
//! One `Relay` per process in production; tests construct several in one
//! process and wire them up over loopback. The control listener speaks the
//! 560-series with the local client, the peer listener speaks the
//! 9000-series with other relays. Both feed the dispatcher in `engine`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use veil_core::{
    Config, Frame, Hostkey, Peer, TunnelId, TAG_TUNNEL_DATA, TAG_TUNNEL_DESTROY,
};
use veil_crypto::{fingerprint_tag, Identity};

use crate::socket::{self, FrameSink, FrameStream};
use crate::table::HopTable;
use crate::{builder, engine, Result};

/// All state one relay instance needs, shared across its tasks.
pub struct Relay {
    pub(crate) config: Config,
    pub(crate) identity: Identity,
    pub(crate) hostkey: Hostkey,
    /// Cached fingerprint tag of our own hostkey.
    pub(crate) tag: [u8; 2],
    pub(crate) table: HopTable,
    /// Sink of the most recently connected control client.
    control: Mutex<Option<FrameSink>>,
}

impl Relay {
    /// Validate the configuration and assemble a relay.
    pub fn new(config: Config, identity: Identity) -> Result<Self> {
        config.validate()?;
        let hostkey = identity.hostkey();
        let tag = fingerprint_tag(&hostkey);
        Ok(Self {
            config,
            identity,
            hostkey,
            tag,
            table: HopTable::new(),
            control: Mutex::new(None),
        })
    }

    pub fn hostkey(&self) -> &Hostkey {
        &self.hostkey
    }

    /// Bind both listeners and start accepting.
    pub async fn start(self) -> Result<RelayHandle> {
        let control_listener = TcpListener::bind(self.config.control_addr()).await?;
        let peer_listener = TcpListener::bind(self.config.peer_addr()).await?;
        let control_addr = control_listener.local_addr()?;
        let peer_addr = peer_listener.local_addr()?;
        info!("Control listener on {}", control_addr);
        info!("Peer listener on {}", peer_addr);

        let relay = Arc::new(self);
        let control_task = tokio::spawn(accept_control(relay.clone(), control_listener));
        let peer_task = tokio::spawn(accept_peers(relay.clone(), peer_listener));
        Ok(RelayHandle {
            relay,
            control_addr,
            peer_addr,
            control_task,
            peer_task,
        })
    }

    /// Send a frame to the control client, if one is connected.
    pub(crate) async fn emit_control(&self, frame: Frame) {
        let sink = self.control.lock().await.clone();
        match sink {
            Some(sink) => {
                if let Err(err) = sink.send(&frame).await {
                    warn!("Failed to notify the control client: {}", err);
                }
            }
            None => debug!("No control client connected; dropping frame {}", frame.tag()),
        }
    }

    pub(crate) async fn emit_error(&self, request_type: u16, tunnel_id: u32) {
        self.emit_control(Frame::TunnelError {
            request_type,
            tunnel_id,
        })
        .await;
    }
}

/// A started relay: its bound addresses and accept tasks.
pub struct RelayHandle {
    relay: Arc<Relay>,
    control_addr: SocketAddr,
    peer_addr: SocketAddr,
    control_task: JoinHandle<()>,
    peer_task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn hostkey(&self) -> Hostkey {
        self.relay.hostkey.clone()
    }

    pub fn table(&self) -> &HopTable {
        &self.relay.table
    }

    /// Resolves when either accept loop stops; the relay is no longer
    /// serving at that point.
    pub async fn wait(&mut self) {
        tokio::select! {
            _ = &mut self.control_task => {}
            _ = &mut self.peer_task => {}
        }
    }

    /// Stop accepting new connections. Established connections die with
    /// their sockets.
    pub fn shutdown(&self) {
        self.control_task.abort();
        self.peer_task.abort();
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_control(relay: Arc<Relay>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let (stream, sink) = socket::split(stream, addr);
                tokio::spawn(handle_control_conn(relay.clone(), stream, sink));
            }
            Err(err) => error!("Control accept failed: {}", err),
        }
    }
}

async fn accept_peers(relay: Arc<Relay>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Peer connection from {}", addr);
                let (stream, sink) = socket::split(stream, addr);
                tokio::spawn(engine::handle_peer_conn(relay.clone(), stream, sink));
            }
            Err(err) => error!("Peer accept failed: {}", err),
        }
    }
}

/// Serve one control client until it disconnects.
///
/// The control socket is a local long-lived command channel; unlike peer
/// sockets it does not idle out.
async fn handle_control_conn(relay: Arc<Relay>, mut stream: FrameStream, sink: FrameSink) {
    info!("Control client connected from {}", stream.peer());
    *relay.control.lock().await = Some(sink.clone());

    loop {
        let frame = match stream.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Control client disconnected");
                break;
            }
            Err(err) => {
                warn!("Control connection failed: {}", err);
                break;
            }
        };

        match frame {
            Frame::TunnelBuild {
                dest_addr,
                dest_port,
                dest_hostkey,
            } => {
                let dest = Peer {
                    addr: SocketAddr::new(dest_addr, dest_port),
                    hostkey: dest_hostkey,
                };
                tokio::spawn(builder::handle_build(relay.clone(), dest));
            }
            Frame::TunnelDestroy { tunnel_id } => {
                if let Err(err) =
                    engine::destroy_tunnel(&relay, tunnel_id as TunnelId, None).await
                {
                    warn!("Destroy of tunnel {} failed: {}", tunnel_id, err);
                    relay.emit_error(TAG_TUNNEL_DESTROY, tunnel_id).await;
                }
            }
            Frame::TunnelData { tunnel_id, payload } => {
                if let Err(err) = builder::send_data(&relay, tunnel_id, payload).await {
                    warn!("Data on tunnel {} failed: {}", tunnel_id, err);
                    relay.emit_error(TAG_TUNNEL_DATA, tunnel_id).await;
                }
            }
            Frame::TunnelCover { cover_size } => {
                tokio::spawn(builder::handle_cover(relay.clone(), cover_size));
            }
            other => warn!("Dropping unexpected control frame {}", other.tag()),
        }
    }

    let mut control = relay.control.lock().await;
    if control
        .as_ref()
        .map(|current| current.same_connection(&sink))
        .unwrap_or(false)
    {
        *control = None;
    }
}
