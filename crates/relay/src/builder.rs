//! Initiator-side tunnel construction.
//!
//! A build is one linear sequence of request-response exchanges on the
//! first-hop socket: ping, k-1 extensions, then the destination bind. The
//! per-tunnel key list grows by one hostkey per exchange; each query is
//! sealed once, under the key of the hop it addresses.

use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use tracing::{debug, info, warn};

use veil_core::{Frame, Peer, TunnelId, TunnelState, TAG_TUNNEL_BUILD, TAG_TUNNEL_COVER};

use crate::engine;
use crate::relay::Relay;
use crate::table::Hop;
use crate::{rps, RelayError, Result};

/// Run a control-client build and report the outcome back to it.
pub(crate) async fn handle_build(relay: Arc<Relay>, dest: Peer) {
    let dest_hostkey = dest.hostkey.clone();
    match build_tunnel(&relay, dest).await {
        Ok(tunnel_id) => {
            info!("Tunnel {} ready", tunnel_id);
            relay
                .emit_control(Frame::TunnelReady {
                    tunnel_id: tunnel_id.into(),
                    dest_hostkey,
                })
                .await;
        }
        Err((tunnel_id, err)) => {
            warn!("Tunnel build failed: {}", err);
            relay.emit_error(TAG_TUNNEL_BUILD, tunnel_id).await;
        }
    }
}

/// Build a tunnel to `dest` through `min_hops` sampled intermediates.
///
/// On failure the partial tunnel is reaped; the error carries the allocated
/// id (zero if the build failed before allocation).
pub(crate) async fn build_tunnel(
    relay: &Arc<Relay>,
    dest: Peer,
) -> std::result::Result<TunnelId, (u32, RelayError)> {
    let mut allocated = None;
    match build_inner(relay, &dest, &mut allocated).await {
        Ok(()) => Ok(allocated.expect("id allocated on success")),
        Err(err) => {
            // Reap the partial tunnel; the id becomes reusable.
            if let Some(tunnel_id) = allocated {
                relay
                    .table
                    .update(tunnel_id, |tunnel| tunnel.state = TunnelState::Inactive);
                if let Some(tunnel) = relay.table.remove(tunnel_id) {
                    if let Some(sink) = tunnel.next.and_then(|hop| hop.sink) {
                        sink.close().await;
                    }
                }
            }
            Err((allocated.map(u32::from).unwrap_or(0), err))
        }
    }
}

async fn build_inner(
    relay: &Arc<Relay>,
    dest: &Peer,
    allocated: &mut Option<TunnelId>,
) -> Result<()> {
    let config = &relay.config;

    let first = rps::random_peer(&config.rps_addr, config.timeout()).await?;
    let tunnel_id = relay.table.allocate_outbound(Hop {
        addr: Some(first.addr),
        hostkey: None,
        sink: None,
    })?;
    *allocated = Some(tunnel_id);
    debug!("Building tunnel {} through first hop {}", tunnel_id, first.addr);

    let (mut stream, sink, first_key) = engine::ping_exchange(relay, tunnel_id, &first).await?;
    relay.table.insert_or_update(tunnel_id, |tunnel, _| {
        tunnel.next = Some(Hop::connected(first.addr, Some(first_key.clone()), sink.clone()));
    });

    // Hostkeys of hops 1..k, in extension order. The key at the highest
    // position addresses the next query.
    let mut hop_keys = vec![first_key];

    for hop in 1..config.min_hops {
        let query = Frame::NextHopQuery { tunnel_id };
        engine::send_sealed(&sink, hop_keys.last().unwrap(), tunnel_id, &query).await?;
        match engine::await_response(relay, &mut stream, tunnel_id).await? {
            Frame::NextHopResponse { hostkey, .. } => {
                debug!(
                    "Tunnel {} extended to hop {} ({}..)",
                    tunnel_id,
                    hop + 1,
                    hostkey.short()
                );
                hop_keys.push(hostkey);
            }
            _ => return Err(RelayError::Protocol("expected a next hop response")),
        }
    }

    let bind = Frame::FinalHopQuery {
        tunnel_id,
        dest_addr: dest.addr.ip(),
        dest_port: dest.addr.port(),
        dest_hostkey: dest.hostkey.clone(),
    };
    engine::send_sealed(&sink, hop_keys.last().unwrap(), tunnel_id, &bind).await?;
    match engine::await_response(relay, &mut stream, tunnel_id).await? {
        Frame::NextHopResponse { hostkey, .. } => {
            // The observed hostkey proves the path really ends at the
            // requested destination.
            if hostkey != dest.hostkey {
                return Err(RelayError::HostkeyMismatch(tunnel_id));
            }
        }
        _ => return Err(RelayError::Protocol("expected the destination hostkey")),
    }

    relay.table.insert_or_update(tunnel_id, |tunnel, _| {
        tunnel.state = TunnelState::Active;
        tunnel.dest_hostkey = Some(dest.hostkey.clone());
    });

    // Construction is done; backward traffic flows through the regular
    // dispatcher from here on.
    let pump = relay.clone();
    tokio::spawn(async move {
        engine::handle_peer_conn(pump, stream, sink).await;
    });
    Ok(())
}

/// Send a control-client payload through a tunnel this relay terminates on
/// either end.
pub(crate) async fn send_data(relay: &Arc<Relay>, tunnel_id: u32, payload: Bytes) -> Result<()> {
    let id = tunnel_id as TunnelId;
    let tunnel = relay
        .table
        .lookup(id)
        .ok_or(RelayError::UnknownTunnel(id))?;
    let frame = Frame::TunnelData { tunnel_id, payload };

    if tunnel.is_initiator() {
        let dest = tunnel.dest_hostkey.clone().ok_or(RelayError::RouteGone)?;
        let sink = tunnel
            .next
            .and_then(|hop| hop.sink)
            .ok_or(RelayError::RouteGone)?;
        engine::send_sealed(&sink, &dest, id, &frame).await
    } else if tunnel.is_terminus() {
        let prev = tunnel.prev.ok_or(RelayError::RouteGone)?;
        match (prev.hostkey, prev.sink) {
            (Some(key), Some(sink)) => engine::send_sealed(&sink, &key, id, &frame).await,
            _ => Err(RelayError::RouteGone),
        }
    } else {
        // A mid-path relay has no business originating tunnel data.
        Err(RelayError::RouteGone)
    }
}

/// Build an ephemeral tunnel to a sampled destination, push `cover_size`
/// random bytes through it, and tear it down again.
pub(crate) async fn handle_cover(relay: Arc<Relay>, cover_size: u16) {
    if relay.table.any_active() {
        warn!("Rejecting cover request while a tunnel is active");
        relay.emit_error(TAG_TUNNEL_COVER, 0).await;
        return;
    }

    let result = async {
        let dest = rps::random_peer(&relay.config.rps_addr, relay.config.timeout()).await?;
        let tunnel_id = build_tunnel(&relay, dest).await.map_err(|(_, err)| err)?;

        let mut noise = vec![0u8; cover_size as usize];
        rand::thread_rng().fill_bytes(&mut noise);
        send_data(&relay, tunnel_id.into(), noise.into()).await?;

        engine::destroy_tunnel(&relay, tunnel_id, None).await
    }
    .await;

    match result {
        Ok(()) => debug!("Cover traffic of {} bytes sent", cover_size),
        // Cover tunnels announce nothing to the control client; a failed
        // one just disappears.
        Err(err) => warn!("Cover traffic failed: {}", err),
    }
}
