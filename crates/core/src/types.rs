use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Process-local tunnel identifier.
///
/// The peer-to-peer frames carry this width on the wire; control-plane frames
/// carry it zero-extended to 32 bits.
pub type TunnelId = u16;

/// Module type announcing the tunnel service in an RPS port map.
pub const TUNNEL_MODULE: u16 = 560;

/// A peer's long-term public key, treated as an opaque byte string.
///
/// The crypto crate interprets it; everything else only moves it around or
/// hashes it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hostkey(Vec<u8>);

impl Hostkey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(4)])
    }
}

impl From<&[u8]> for Hostkey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<[u8; 32]> for Hostkey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for Hostkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hostkey({}..)", self.short())
    }
}

/// A candidate relay as returned by the peer sampling service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub addr: SocketAddr,
    pub hostkey: Hostkey,
}

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    /// Construction in progress; not yet announced to the control client.
    Building,
    /// Fully built and verified end to end.
    Active,
    /// Destroy observed; adjacent sockets are being closed.
    TearingDown,
    /// Terminal state; the id may be reused once the entry is reaped.
    Inactive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostkey_short_prefix() {
        let key = Hostkey::new(vec![0xAB, 0xCD, 0xEF, 0x01, 0x23]);
        assert_eq!(key.short(), "abcdef01");

        let tiny = Hostkey::new(vec![0xFF]);
        assert_eq!(tiny.short(), "ff");
    }

    #[test]
    fn test_hostkey_equality() {
        let a = Hostkey::new(vec![1, 2, 3]);
        let b = Hostkey::from(&[1u8, 2, 3][..]);
        assert_eq!(a, b);
        assert_ne!(a, Hostkey::new(vec![1, 2]));
    }
}
