//! Frame dispatch on peer connections.
//!
//! Every peer connection, accepted or dialed, runs the same loop: read a
//! frame, act, repeat. The forward-or-terminate decision for sealed
//! envelopes lives here, as does the intermediate side of the extension
//! protocol. A lost or timed-out connection tears down every tunnel routed
//! through it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use veil_core::{Frame, Hostkey, Peer, TunnelId, TunnelState, TAG_TUNNEL_DATA};
use veil_crypto::{fingerprint_tag, open, seal};

use crate::relay::Relay;
use crate::socket::{self, FrameSink, FrameStream};
use crate::table::Hop;
use crate::{rps, RelayError, Result};

/// Drive one peer connection until EOF, error, or idle timeout.
///
/// Returns an explicitly boxed, type-erased future (rather than being an
/// `async fn` itself): `extend` below spawns a new instance of this same
/// loop, and that mutual reference makes the compiler unable to prove
/// auto-trait (`Send`) membership for the naturally-inferred opaque type.
/// Erasing the type here breaks that cycle.
pub(crate) fn handle_peer_conn(
    relay: Arc<Relay>,
    mut stream: FrameStream,
    sink: FrameSink,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
    let timeout = relay.config.timeout();
    loop {
        let frame = match stream.recv_timeout(timeout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Peer {} closed the connection", stream.peer());
                break;
            }
            Err(err) => {
                warn!("Peer connection {} failed: {}", stream.peer(), err);
                break;
            }
        };

        let result = match frame {
            Frame::Ping { tunnel_id, hostkey } => {
                handle_ping(&relay, &sink, tunnel_id, hostkey).await
            }
            Frame::Data {
                tunnel_id,
                hop_tag,
                payload,
            } => handle_data(&relay, &sink, tunnel_id, hop_tag, payload).await,
            Frame::TunnelDestroy { tunnel_id } => {
                match destroy_tunnel(&relay, tunnel_id as TunnelId, Some(&sink)).await {
                    // Already reaped, e.g. by a racing connection loss.
                    Err(RelayError::UnknownTunnel(_)) => Ok(()),
                    other => other,
                }
            }
            other => {
                warn!(
                    "Dropping unexpected frame {} from peer {}",
                    other.tag(),
                    stream.peer()
                );
                Ok(())
            }
        };

        // Protocol-level failures do not imply a broken transport; log and
        // keep reading.
        if let Err(err) = result {
            warn!("Error handling frame from {}: {}", stream.peer(), err);
        }
    }
    connection_lost(&relay, &sink).await;
    })
}

/// First contact on a tunnel: record the previous hop and answer with our
/// hostkey, sealed for the sender.
async fn handle_ping(
    relay: &Arc<Relay>,
    sink: &FrameSink,
    tunnel_id: TunnelId,
    sender: Hostkey,
) -> Result<()> {
    let response = Frame::PingResponse {
        tunnel_id,
        hostkey: relay.hostkey.clone(),
    };
    let envelope = match seal(&response.to_bytes()?, &sender) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("Cannot answer ping on tunnel {}: {}", tunnel_id, err);
            return Ok(());
        }
    };

    let fresh = relay.table.insert_or_update(tunnel_id, |tunnel, created| {
        if created {
            tunnel.prev = Some(Hop::connected(sink.peer(), Some(sender.clone()), sink.clone()));
            true
        } else {
            false
        }
    });
    // The previous hop is immutable once set; a repeated ping is a protocol
    // error, not a reassignment.
    if !fresh {
        warn!("Ignoring ping for already known tunnel {}", tunnel_id);
        return Ok(());
    }

    debug!(
        "Tunnel {} opened by {} ({}..)",
        tunnel_id,
        sink.peer(),
        sender.short()
    );
    sink.send(&Frame::Data {
        tunnel_id,
        hop_tag: fingerprint_tag(&sender),
        payload: envelope.into(),
    })
    .await
}

/// The forward-or-terminate rule for sealed envelopes.
async fn handle_data(
    relay: &Arc<Relay>,
    sink: &FrameSink,
    tunnel_id: TunnelId,
    hop_tag: [u8; 2],
    payload: Bytes,
) -> Result<()> {
    if hop_tag != relay.tag {
        return forward(relay, sink, tunnel_id, hop_tag, payload).await;
    }

    // Addressed to this relay: peel the layer and act on the inner frame.
    let plaintext = match open(&payload, &relay.identity) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            warn!("Undecryptable envelope on tunnel {}: {}", tunnel_id, err);
            return Ok(());
        }
    };
    let inner = match Frame::parse(&plaintext) {
        Ok(inner) => inner,
        Err(err) => {
            warn!("Unparsable envelope payload on tunnel {}: {}", tunnel_id, err);
            return Ok(());
        }
    };
    handle_sealed(relay, tunnel_id, inner).await
}

/// Forward an envelope verbatim to the tunnel's other side.
async fn forward(
    relay: &Arc<Relay>,
    sink: &FrameSink,
    tunnel_id: TunnelId,
    hop_tag: [u8; 2],
    payload: Bytes,
) -> Result<()> {
    let Some(tunnel) = relay.table.lookup(tunnel_id) else {
        warn!("Envelope for unknown tunnel {}", tunnel_id);
        relay.emit_error(TAG_TUNNEL_DATA, tunnel_id.into()).await;
        return Ok(());
    };

    let arrived_from_prev = tunnel
        .prev
        .as_ref()
        .map(|hop| hop.uses_connection(sink))
        .unwrap_or(false);
    let arrived_from_next = tunnel
        .next
        .as_ref()
        .map(|hop| hop.uses_connection(sink))
        .unwrap_or(false);

    let out = if arrived_from_prev {
        tunnel.next.and_then(|hop| hop.sink)
    } else if arrived_from_next {
        tunnel.prev.and_then(|hop| hop.sink)
    } else {
        None
    };

    match out {
        Some(out) => {
            out.send(&Frame::Data {
                tunnel_id,
                hop_tag,
                payload,
            })
            .await
        }
        None => {
            warn!("No forward route for tunnel {}", tunnel_id);
            relay.emit_error(TAG_TUNNEL_DATA, tunnel_id.into()).await;
            Ok(())
        }
    }
}

/// Act on a frame recovered from an envelope addressed to this relay.
async fn handle_sealed(relay: &Arc<Relay>, outer_id: TunnelId, inner: Frame) -> Result<()> {
    match &inner {
        Frame::NextHopQuery { tunnel_id } if *tunnel_id == outer_id => {
            extend(relay, outer_id, None).await
        }
        Frame::FinalHopQuery {
            tunnel_id,
            dest_addr,
            dest_port,
            dest_hostkey,
        } if *tunnel_id == outer_id => {
            let dest = Peer {
                addr: std::net::SocketAddr::new(*dest_addr, *dest_port),
                hostkey: dest_hostkey.clone(),
            };
            extend(relay, outer_id, Some(dest)).await
        }
        Frame::NextHopResponse { tunnel_id, .. } if *tunnel_id == outer_id => {
            relay_backward(relay, outer_id, inner.clone()).await
        }
        Frame::TunnelData { tunnel_id, .. } if *tunnel_id as TunnelId == outer_id => {
            handle_terminal_data(relay, outer_id, inner.clone()).await
        }
        other => {
            warn!(
                "Dropping unexpected sealed frame {} on tunnel {}",
                other.tag(),
                outer_id
            );
            Ok(())
        }
    }
}

/// Extend the tunnel by one hop: a sampled peer for NEXT_HOP_QUERY, the
/// given destination for FINAL_HOP_QUERY. The new hop's hostkey travels
/// back to the previous hop either way.
async fn extend(relay: &Arc<Relay>, tunnel_id: TunnelId, fixed_dest: Option<Peer>) -> Result<()> {
    let tunnel = relay
        .table
        .lookup(tunnel_id)
        .ok_or(RelayError::UnknownTunnel(tunnel_id))?;
    let prev = tunnel
        .prev
        .ok_or(RelayError::Protocol("extension query without a previous hop"))?;
    let prev_key = prev
        .hostkey
        .ok_or(RelayError::Protocol("previous hop has no hostkey"))?;
    let prev_sink = prev.sink.ok_or(RelayError::RouteGone)?;
    if tunnel.next.is_some() {
        return Err(RelayError::Protocol("tunnel already has a next hop"));
    }

    let peer = match fixed_dest {
        Some(dest) => dest,
        None => rps::random_peer(&relay.config.rps_addr, relay.config.timeout()).await?,
    };

    let (stream, next_sink, next_key) = ping_exchange(relay, tunnel_id, &peer).await?;
    debug!(
        "Tunnel {} extended to {} ({}..)",
        tunnel_id,
        peer.addr,
        next_key.short()
    );

    relay.table.insert_or_update(tunnel_id, |tunnel, _| {
        tunnel.next = Some(Hop::connected(
            peer.addr,
            Some(next_key.clone()),
            next_sink.clone(),
        ));
        tunnel.state = TunnelState::Active;
    });

    // Deeper responses and backward data arrive on the new socket; feed them
    // through the regular dispatcher.
    let pump = relay.clone();
    tokio::spawn(handle_peer_conn(pump, stream, next_sink));

    let response = Frame::NextHopResponse {
        tunnel_id,
        hostkey: next_key,
    };
    send_sealed(&prev_sink, &prev_key, tunnel_id, &response).await
}

/// Re-seal an initiator-bound frame for the previous hop and send it
/// backward.
async fn relay_backward(relay: &Arc<Relay>, tunnel_id: TunnelId, inner: Frame) -> Result<()> {
    let tunnel = relay
        .table
        .lookup(tunnel_id)
        .ok_or(RelayError::UnknownTunnel(tunnel_id))?;
    let prev = tunnel
        .prev
        .ok_or(RelayError::Protocol("initiator-bound frame on an initiator"))?;
    match (prev.hostkey, prev.sink) {
        (Some(key), Some(sink)) => send_sealed(&sink, &key, tunnel_id, &inner).await,
        _ => Err(RelayError::RouteGone),
    }
}

/// A TUNNEL_DATA recovered from an envelope addressed to this relay.
async fn handle_terminal_data(relay: &Arc<Relay>, tunnel_id: TunnelId, inner: Frame) -> Result<()> {
    let Some(tunnel) = relay.table.lookup(tunnel_id) else {
        relay.emit_error(TAG_TUNNEL_DATA, tunnel_id.into()).await;
        return Ok(());
    };

    if tunnel.is_initiator() {
        relay.emit_control(inner).await;
        Ok(())
    } else if tunnel.is_terminus() {
        let first = relay.table.insert_or_update(tunnel_id, |tunnel, _| {
            let first = !tunnel.announced_incoming;
            tunnel.announced_incoming = true;
            tunnel.state = TunnelState::Active;
            first
        });
        if first {
            relay
                .emit_control(Frame::TunnelIncoming {
                    tunnel_id: tunnel_id.into(),
                })
                .await;
        }
        relay.emit_control(inner).await;
        Ok(())
    } else {
        // Backward data addressed to a mid-path relay moves on toward the
        // initiator under the previous hop's key.
        relay_backward(relay, tunnel_id, inner).await
    }
}

/// Remove a tunnel, notify the sides the destroy did not come from, and
/// close both adjacent sockets.
pub(crate) async fn destroy_tunnel(
    relay: &Arc<Relay>,
    tunnel_id: TunnelId,
    origin: Option<&FrameSink>,
) -> Result<()> {
    relay
        .table
        .update(tunnel_id, |tunnel| tunnel.state = TunnelState::TearingDown);
    let tunnel = relay
        .table
        .remove(tunnel_id)
        .ok_or(RelayError::UnknownTunnel(tunnel_id))?;
    debug!("Destroying tunnel {}", tunnel_id);

    for hop in [tunnel.prev, tunnel.next].into_iter().flatten() {
        let Some(sink) = hop.sink else { continue };
        let is_origin = origin
            .map(|origin| sink.same_connection(origin))
            .unwrap_or(false);
        if !is_origin {
            let _ = sink
                .send(&Frame::TunnelDestroy {
                    tunnel_id: tunnel_id.into(),
                })
                .await;
        }
        sink.close().await;
    }
    Ok(())
}

/// Tear down everything routed through a dead connection.
pub(crate) async fn connection_lost(relay: &Arc<Relay>, sink: &FrameSink) {
    let ids = relay.table.on_connection(sink);
    if ids.is_empty() {
        return;
    }
    warn!(
        "Connection to {} gone; tearing down {} tunnel(s)",
        sink.peer(),
        ids.len()
    );
    for tunnel_id in ids {
        let Some(tunnel) = relay.table.remove(tunnel_id) else {
            continue;
        };
        if tunnel.is_initiator() {
            relay.emit_error(TAG_TUNNEL_DATA, tunnel_id.into()).await;
        }
        for hop in [tunnel.prev, tunnel.next].into_iter().flatten() {
            let Some(other) = hop.sink else { continue };
            if !other.same_connection(sink) {
                let _ = other
                    .send(&Frame::TunnelDestroy {
                        tunnel_id: tunnel_id.into(),
                    })
                    .await;
                other.close().await;
            }
        }
    }
}

/// Dial a peer and run the ping exchange that reveals its hostkey.
pub(crate) async fn ping_exchange(
    relay: &Arc<Relay>,
    tunnel_id: TunnelId,
    peer: &Peer,
) -> Result<(FrameStream, FrameSink, Hostkey)> {
    let (mut stream, sink) = socket::connect(peer.addr, relay.config.timeout()).await?;
    sink.send(&Frame::Ping {
        tunnel_id,
        hostkey: relay.hostkey.clone(),
    })
    .await?;

    match await_response(relay, &mut stream, tunnel_id).await? {
        Frame::PingResponse {
            tunnel_id: tid,
            hostkey,
        } if tid == tunnel_id => Ok((stream, sink, hostkey)),
        _ => Err(RelayError::Protocol("expected a ping response")),
    }
}

/// Await the next frame addressed to this relay on `stream`, stripping
/// sealed layers until something other than an envelope emerges.
///
/// Used only during construction exchanges, so crypto and codec failures
/// propagate and fail the build.
pub(crate) async fn await_response(
    relay: &Relay,
    stream: &mut FrameStream,
    tunnel_id: TunnelId,
) -> Result<Frame> {
    let timeout = relay.config.timeout();
    loop {
        let frame = stream
            .recv_timeout(timeout)
            .await?
            .ok_or(RelayError::ConnectionClosed)?;
        match frame {
            Frame::Data {
                tunnel_id: tid,
                hop_tag,
                payload,
            } if tid == tunnel_id && hop_tag == relay.tag => {
                let mut plaintext = open(&payload, &relay.identity)?;
                loop {
                    match Frame::parse(&plaintext)? {
                        Frame::Data {
                            hop_tag, payload, ..
                        } if hop_tag == relay.tag => {
                            plaintext = open(&payload, &relay.identity)?;
                        }
                        inner => return Ok(inner),
                    }
                }
            }
            Frame::TunnelDestroy { tunnel_id: tid } if tid as TunnelId == tunnel_id => {
                return Err(RelayError::Protocol("tunnel destroyed during construction"));
            }
            other => {
                warn!(
                    "Ignoring frame {} while awaiting a response on tunnel {}",
                    other.tag(),
                    tunnel_id
                );
            }
        }
    }
}

/// Seal `frame` for `recipient` and send it as an addressed envelope.
pub(crate) async fn send_sealed(
    sink: &FrameSink,
    recipient: &Hostkey,
    tunnel_id: TunnelId,
    frame: &Frame,
) -> Result<()> {
    let envelope = seal(&frame.to_bytes()?, recipient)?;
    sink.send(&Frame::Data {
        tunnel_id,
        hop_tag: fingerprint_tag(recipient),
        payload: envelope.into(),
    })
    .await
}
