//! Per-tunnel routing state.
//!
//! The hop table is the single source of truth for routing ("who is this
//! tunnel's next hop?") and liveness ("is this tunnel known?"). It borrows
//! connections, it does not own them: sinks are cloneable handles and the
//! reader tasks keep the sockets alive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use rand::Rng;

use veil_core::{Hostkey, TunnelId, TunnelState};

use crate::socket::FrameSink;
use crate::{RelayError, Result};

/// One adjacent peer of a tunnel.
///
/// A peer hop is known by address; an anonymous hop (learned as the next hop
/// of a next hop) only ever has a hostkey. The connection is absent until
/// established.
#[derive(Clone)]
pub struct Hop {
    pub addr: Option<SocketAddr>,
    pub hostkey: Option<Hostkey>,
    pub sink: Option<FrameSink>,
}

impl Hop {
    /// A hop reached over an established connection.
    pub fn connected(addr: SocketAddr, hostkey: Option<Hostkey>, sink: FrameSink) -> Self {
        Self {
            addr: Some(addr),
            hostkey,
            sink: Some(sink),
        }
    }

    pub fn uses_connection(&self, sink: &FrameSink) -> bool {
        self.sink
            .as_ref()
            .map(|own| own.same_connection(sink))
            .unwrap_or(false)
    }
}

/// One onion tunnel as seen from this relay.
#[derive(Clone)]
pub struct Tunnel {
    pub id: TunnelId,
    pub state: TunnelState,
    /// Neighbor closer to the initiator; absent if this relay initiated.
    pub prev: Option<Hop>,
    /// Neighbor closer to the destination; absent at the terminus.
    pub next: Option<Hop>,
    /// Verified destination hostkey; set on the initiator only.
    pub dest_hostkey: Option<Hostkey>,
    /// Whether the terminus already told its control client about the tunnel.
    pub announced_incoming: bool,
}

impl Tunnel {
    pub fn new(id: TunnelId) -> Self {
        Self {
            id,
            state: TunnelState::Building,
            prev: None,
            next: None,
            dest_hostkey: None,
            announced_incoming: false,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.prev.is_none()
    }

    pub fn is_terminus(&self) -> bool {
        self.next.is_none()
    }
}

/// Process-wide `tunnel id -> tunnel` map with concurrent reads and
/// serialized writes.
pub struct HopTable {
    inner: RwLock<HashMap<TunnelId, Tunnel>>,
}

impl Default for HopTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HopTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve a random free id for an outbound tunnel whose first hop is
    /// already known by address.
    pub fn allocate_outbound(&self, next: Hop) -> Result<TunnelId> {
        let mut map = self.inner.write().expect("hop table lock poisoned");
        if map.len() >= usize::from(u16::MAX) {
            return Err(RelayError::IdsExhausted);
        }
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: TunnelId = rng.gen();
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };
        let mut tunnel = Tunnel::new(id);
        tunnel.next = Some(next);
        map.insert(id, tunnel);
        Ok(id)
    }

    /// Atomic read-modify-write. Creates the entry if absent; the mutator
    /// learns whether it did via its second argument.
    pub fn insert_or_update<R>(
        &self,
        id: TunnelId,
        mutate: impl FnOnce(&mut Tunnel, bool) -> R,
    ) -> R {
        let mut map = self.inner.write().expect("hop table lock poisoned");
        let created = !map.contains_key(&id);
        let tunnel = map.entry(id).or_insert_with(|| Tunnel::new(id));
        mutate(tunnel, created)
    }

    /// Mutate an existing entry. Returns false if the tunnel is unknown.
    pub fn update(&self, id: TunnelId, mutate: impl FnOnce(&mut Tunnel)) -> bool {
        let mut map = self.inner.write().expect("hop table lock poisoned");
        match map.get_mut(&id) {
            Some(tunnel) => {
                mutate(tunnel);
                true
            }
            None => false,
        }
    }

    /// A snapshot of the tunnel, if known.
    pub fn lookup(&self, id: TunnelId) -> Option<Tunnel> {
        self.inner
            .read()
            .expect("hop table lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: TunnelId) -> Option<Tunnel> {
        self.inner
            .write()
            .expect("hop table lock poisoned")
            .remove(&id)
    }

    pub fn contains(&self, id: TunnelId) -> bool {
        self.inner
            .read()
            .expect("hop table lock poisoned")
            .contains_key(&id)
    }

    pub fn any_active(&self) -> bool {
        self.inner
            .read()
            .expect("hop table lock poisoned")
            .values()
            .any(|t| t.state == TunnelState::Active)
    }

    /// Ids of every tunnel adjacent to the given connection.
    pub fn on_connection(&self, sink: &FrameSink) -> Vec<TunnelId> {
        self.inner
            .read()
            .expect("hop table lock poisoned")
            .values()
            .filter(|t| {
                t.prev.as_ref().map(|h| h.uses_connection(sink)).unwrap_or(false)
                    || t.next.as_ref().map(|h| h.uses_connection(sink)).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("hop table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::{TcpListener, TcpStream};

    use crate::socket;

    async fn sink() -> FrameSink {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _ = listener.accept().await.unwrap();
        socket::split(client, addr).1
    }

    fn peer_hop(addr: &str) -> Hop {
        Hop {
            addr: Some(addr.parse().unwrap()),
            hostkey: None,
            sink: None,
        }
    }

    #[test]
    fn test_allocate_reserves_unique_ids() {
        let table = HopTable::new();
        let a = table.allocate_outbound(peer_hop("127.0.0.1:4000")).unwrap();
        let b = table.allocate_outbound(peer_hop("127.0.0.1:4001")).unwrap();
        assert_ne!(a, b);
        assert!(table.contains(a));
        assert!(table.contains(b));
    }

    #[test]
    fn test_insert_or_update_reports_creation() {
        let table = HopTable::new();
        let created = table.insert_or_update(7, |_, created| created);
        assert!(created);
        let created = table.insert_or_update(7, |_, created| created);
        assert!(!created);
    }

    #[test]
    fn test_every_entry_has_at_least_one_side() {
        let table = HopTable::new();
        table.allocate_outbound(peer_hop("127.0.0.1:4000")).unwrap();
        table.insert_or_update(12, |t, _| {
            t.prev = Some(peer_hop("127.0.0.1:5000"));
        });

        let map = table.inner.read().unwrap();
        for tunnel in map.values() {
            assert!(
                tunnel.prev.is_some() || tunnel.next.is_some(),
                "tunnel {} has neither side",
                tunnel.id
            );
        }
    }

    #[test]
    fn test_update_only_touches_known_tunnels() {
        let table = HopTable::new();
        let id = table.allocate_outbound(peer_hop("127.0.0.1:4000")).unwrap();
        assert!(table.update(id, |t| t.state = TunnelState::TearingDown));
        assert_eq!(table.lookup(id).unwrap().state, TunnelState::TearingDown);
        assert!(!table.update(id.wrapping_add(1), |t| t.state = TunnelState::Active));
    }

    #[test]
    fn test_remove_reaps_state() {
        let table = HopTable::new();
        let id = table.allocate_outbound(peer_hop("127.0.0.1:4000")).unwrap();
        assert!(table.remove(id).is_some());
        assert!(!table.contains(id));
        assert!(table.remove(id).is_none());
    }

    #[test]
    fn test_any_active_tracks_state() {
        let table = HopTable::new();
        let id = table.allocate_outbound(peer_hop("127.0.0.1:4000")).unwrap();
        assert!(!table.any_active());
        table.insert_or_update(id, |t, _| t.state = TunnelState::Active);
        assert!(table.any_active());
    }

    #[tokio::test]
    async fn test_on_connection_matches_by_identity() {
        let table = HopTable::new();
        let conn_a = sink().await;
        let conn_b = sink().await;

        table.insert_or_update(1, |t, _| {
            t.prev = Some(Hop {
                addr: Some(conn_a.peer()),
                hostkey: None,
                sink: Some(conn_a.clone()),
            });
        });
        table.insert_or_update(2, |t, _| {
            t.next = Some(Hop {
                addr: Some(conn_b.peer()),
                hostkey: None,
                sink: Some(conn_b.clone()),
            });
        });

        assert_eq!(table.on_connection(&conn_a), vec![1]);
        assert_eq!(table.on_connection(&conn_b), vec![2]);
    }
}
