//! Veil Relay
//!
//! The tunnel construction and relay engine: a two-listener dispatcher, the
//! per-tunnel hop table, the hop-by-hop extension protocol, and the
//! peel-or-forward rule for sealed envelopes.

mod builder;
mod engine;
mod relay;
mod rps;
pub mod socket;
mod table;

pub use relay::{Relay, RelayHandle};
pub use rps::random_peer;
pub use socket::{FrameSink, FrameStream};
pub use table::{Hop, HopTable, Tunnel};

use thiserror::Error;

use veil_core::TunnelId;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] veil_core::ConfigError),

    #[error("Hostkey error: {0}")]
    Key(#[from] veil_crypto::KeyError),

    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for the remote side")]
    Timeout,

    #[error("Connection closed by the remote side")]
    ConnectionClosed,

    #[error("Codec error: {0}")]
    Frame(#[from] veil_core::FrameError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),

    #[error("Protocol violation: {0}")]
    Protocol(&'static str),

    #[error("Peer sampling failed: {0}")]
    PeerSource(String),

    #[error("No free tunnel id")]
    IdsExhausted,

    #[error("Unknown tunnel {0}")]
    UnknownTunnel(TunnelId),

    #[error("Destination hostkey mismatch on tunnel {0}")]
    HostkeyMismatch(TunnelId),

    #[error("Tunnel has no route in that direction")]
    RouteGone,

    #[error("Cover traffic is only allowed while no tunnel is active")]
    CoverBusy,
}

pub type Result<T> = std::result::Result<T, RelayError>;
