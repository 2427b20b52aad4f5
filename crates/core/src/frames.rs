//! Wire codec for the Veil frame family.
//!
//! Every frame starts with a 16-bit big-endian length covering header and
//! body, followed by a 16-bit big-endian type tag. The 560-series is the
//! control-plane surface, the 540-series the peer sampling exchange, and the
//! 9000-series the relay-to-relay API. Hostkey fields are opaque trailing
//! bytes.
//!
//! `Frame::parse` never panics on short or malformed input; unknown tags and
//! truncation are first-class outcomes so the dispatcher can log and drop
//! without tearing the connection down.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use thiserror::Error;

use crate::types::{Hostkey, TunnelId};

pub const TAG_RPS_QUERY: u16 = 540;
pub const TAG_RPS_PEER: u16 = 541;
pub const TAG_TUNNEL_BUILD: u16 = 560;
pub const TAG_TUNNEL_READY: u16 = 561;
pub const TAG_TUNNEL_INCOMING: u16 = 562;
pub const TAG_TUNNEL_DESTROY: u16 = 563;
pub const TAG_TUNNEL_DATA: u16 = 564;
pub const TAG_TUNNEL_ERROR: u16 = 565;
pub const TAG_TUNNEL_COVER: u16 = 566;
pub const TAG_PING: u16 = 9000;
pub const TAG_PING_RESPONSE: u16 = 9001;
pub const TAG_NEXT_HOP_QUERY: u16 = 9002;
pub const TAG_NEXT_HOP_RESPONSE: u16 = 9003;
pub const TAG_FINAL_HOP_QUERY: u16 = 9004;
pub const TAG_DATA: u16 = 9005;

/// Size of the common length + type header.
pub const HEADER_LEN: usize = 4;

/// Address-version flag: set means IPv6, clear means IPv4.
const FLAG_IPV6: u16 = 0x0001;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame shorter than its declared length")]
    Truncated,

    #[error("Unknown frame type {0}")]
    UnknownType(u16),

    #[error("Malformed frame body: {0}")]
    Malformed(&'static str),

    #[error("Frame of {0} bytes exceeds the 16-bit length field")]
    Oversized(usize),
}

/// One entry of the RPS_PEER port map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub module: u16,
    pub port: u16,
}

/// The closed family of frames the relay speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 560: control client asks for a tunnel to the given destination.
    TunnelBuild {
        dest_addr: IpAddr,
        dest_port: u16,
        dest_hostkey: Hostkey,
    },
    /// 561: tunnel built and verified.
    TunnelReady { tunnel_id: u32, dest_hostkey: Hostkey },
    /// 562: an inbound tunnel terminates at this relay.
    TunnelIncoming { tunnel_id: u32 },
    /// 563: tear a tunnel down. Also travels bare between relays.
    TunnelDestroy { tunnel_id: u32 },
    /// 564: user payload, either direction.
    TunnelData { tunnel_id: u32, payload: Bytes },
    /// 565: a request failed; `request_type` is the tag of the failed request.
    TunnelError { request_type: u16, tunnel_id: u32 },
    /// 566: send cover traffic through an ephemeral tunnel.
    TunnelCover { cover_size: u16 },

    /// 540: ask the sampling service for one random peer.
    RpsQuery,
    /// 541: one random peer with its module port map.
    RpsPeer {
        port: u16,
        port_map: Vec<PortMapping>,
        addr: IpAddr,
        hostkey: Hostkey,
    },

    /// 9000: first contact on a tunnel; announces the sender's hostkey.
    Ping { tunnel_id: TunnelId, hostkey: Hostkey },
    /// 9001: answers a ping with the receiver's hostkey.
    PingResponse { tunnel_id: TunnelId, hostkey: Hostkey },
    /// 9002: extend the tunnel by one randomly sampled hop.
    NextHopQuery { tunnel_id: TunnelId },
    /// 9003: the hostkey of the hop the tunnel was extended to.
    NextHopResponse { tunnel_id: TunnelId, hostkey: Hostkey },
    /// 9004: extend the tunnel to a fixed destination instead of a sampled one.
    FinalHopQuery {
        tunnel_id: TunnelId,
        dest_addr: IpAddr,
        dest_port: u16,
        dest_hostkey: Hostkey,
    },
    /// 9005: sealed envelope addressed by fingerprint tag.
    Data {
        tunnel_id: TunnelId,
        hop_tag: [u8; 2],
        payload: Bytes,
    },
}

impl Frame {
    /// The wire tag of this frame.
    pub fn tag(&self) -> u16 {
        match self {
            Frame::TunnelBuild { .. } => TAG_TUNNEL_BUILD,
            Frame::TunnelReady { .. } => TAG_TUNNEL_READY,
            Frame::TunnelIncoming { .. } => TAG_TUNNEL_INCOMING,
            Frame::TunnelDestroy { .. } => TAG_TUNNEL_DESTROY,
            Frame::TunnelData { .. } => TAG_TUNNEL_DATA,
            Frame::TunnelError { .. } => TAG_TUNNEL_ERROR,
            Frame::TunnelCover { .. } => TAG_TUNNEL_COVER,
            Frame::RpsQuery => TAG_RPS_QUERY,
            Frame::RpsPeer { .. } => TAG_RPS_PEER,
            Frame::Ping { .. } => TAG_PING,
            Frame::PingResponse { .. } => TAG_PING_RESPONSE,
            Frame::NextHopQuery { .. } => TAG_NEXT_HOP_QUERY,
            Frame::NextHopResponse { .. } => TAG_NEXT_HOP_RESPONSE,
            Frame::FinalHopQuery { .. } => TAG_FINAL_HOP_QUERY,
            Frame::Data { .. } => TAG_DATA,
        }
    }

    /// Parse one complete frame from `buf`.
    ///
    /// `buf` must contain at least the bytes the length header declares;
    /// trailing bytes beyond the declared length are ignored.
    pub fn parse(buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if declared < HEADER_LEN {
            return Err(FrameError::Malformed("length shorter than header"));
        }
        if buf.len() < declared {
            return Err(FrameError::Truncated);
        }
        let tag = u16::from_be_bytes([buf[2], buf[3]]);
        let mut body = Reader::new(&buf[HEADER_LEN..declared]);

        let frame = match tag {
            TAG_TUNNEL_BUILD => {
                let flags = body.u16()?;
                let dest_port = body.u16()?;
                let dest_addr = body.addr(flags & FLAG_IPV6 != 0)?;
                Frame::TunnelBuild {
                    dest_addr,
                    dest_port,
                    dest_hostkey: body.hostkey(),
                }
            }
            TAG_TUNNEL_READY => {
                body.u16()?; // reserved
                Frame::TunnelReady {
                    tunnel_id: body.u32()?,
                    dest_hostkey: body.hostkey(),
                }
            }
            TAG_TUNNEL_INCOMING => {
                body.u16()?;
                Frame::TunnelIncoming { tunnel_id: body.u32()? }
            }
            TAG_TUNNEL_DESTROY => {
                body.u16()?;
                Frame::TunnelDestroy { tunnel_id: body.u32()? }
            }
            TAG_TUNNEL_DATA => {
                body.u16()?;
                Frame::TunnelData {
                    tunnel_id: body.u32()?,
                    payload: body.payload(),
                }
            }
            TAG_TUNNEL_ERROR => {
                let request_type = body.u16()?;
                body.u16()?;
                Frame::TunnelError {
                    request_type,
                    tunnel_id: body.u32()?,
                }
            }
            TAG_TUNNEL_COVER => {
                let cover_size = body.u16()?;
                body.u16()?;
                Frame::TunnelCover { cover_size }
            }
            TAG_RPS_QUERY => Frame::RpsQuery,
            TAG_RPS_PEER => {
                let port = body.u16()?;
                let n_mappings = body.u8()?;
                let flags = body.u8()?;
                let mut port_map = Vec::with_capacity(n_mappings as usize);
                for _ in 0..n_mappings {
                    port_map.push(PortMapping {
                        module: body.u16()?,
                        port: body.u16()?,
                    });
                }
                let addr = body.addr(u16::from(flags) & FLAG_IPV6 != 0)?;
                Frame::RpsPeer {
                    port,
                    port_map,
                    addr,
                    hostkey: body.hostkey(),
                }
            }
            TAG_PING => Frame::Ping {
                tunnel_id: body.u16()?,
                hostkey: body.hostkey(),
            },
            TAG_PING_RESPONSE => Frame::PingResponse {
                tunnel_id: body.u16()?,
                hostkey: body.hostkey(),
            },
            TAG_NEXT_HOP_QUERY => Frame::NextHopQuery { tunnel_id: body.u16()? },
            TAG_NEXT_HOP_RESPONSE => {
                let tunnel_id = body.u16()?;
                body.u16()?; // reserved
                Frame::NextHopResponse {
                    tunnel_id,
                    hostkey: body.hostkey(),
                }
            }
            TAG_FINAL_HOP_QUERY => {
                let tunnel_id = body.u16()?;
                let dest_port = body.u16()?;
                let flags = body.u16()?;
                let dest_addr = body.addr(flags & FLAG_IPV6 != 0)?;
                Frame::FinalHopQuery {
                    tunnel_id,
                    dest_addr,
                    dest_port,
                    dest_hostkey: body.hostkey(),
                }
            }
            TAG_DATA => {
                let tunnel_id = body.u16()?;
                let tag_bytes = body.take(2)?;
                Frame::Data {
                    tunnel_id,
                    hop_tag: [tag_bytes[0], tag_bytes[1]],
                    payload: body.payload(),
                }
            }
            other => return Err(FrameError::UnknownType(other)),
        };
        Ok(frame)
    }

    /// Serialize this frame, length prefix included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let mut body = Vec::new();
        match self {
            Frame::TunnelBuild {
                dest_addr,
                dest_port,
                dest_hostkey,
            } => {
                body.extend_from_slice(&addr_flags(dest_addr).to_be_bytes());
                body.extend_from_slice(&dest_port.to_be_bytes());
                put_addr(&mut body, dest_addr);
                body.extend_from_slice(dest_hostkey.as_bytes());
            }
            Frame::TunnelReady {
                tunnel_id,
                dest_hostkey,
            } => {
                body.extend_from_slice(&0u16.to_be_bytes());
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(dest_hostkey.as_bytes());
            }
            Frame::TunnelIncoming { tunnel_id } | Frame::TunnelDestroy { tunnel_id } => {
                body.extend_from_slice(&0u16.to_be_bytes());
                body.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::TunnelData { tunnel_id, payload } => {
                body.extend_from_slice(&0u16.to_be_bytes());
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(payload);
            }
            Frame::TunnelError {
                request_type,
                tunnel_id,
            } => {
                body.extend_from_slice(&request_type.to_be_bytes());
                body.extend_from_slice(&0u16.to_be_bytes());
                body.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::TunnelCover { cover_size } => {
                body.extend_from_slice(&cover_size.to_be_bytes());
                body.extend_from_slice(&0u16.to_be_bytes());
            }
            Frame::RpsQuery => {}
            Frame::RpsPeer {
                port,
                port_map,
                addr,
                hostkey,
            } => {
                if port_map.len() > u8::MAX as usize {
                    return Err(FrameError::Malformed("port map longer than 255 entries"));
                }
                body.extend_from_slice(&port.to_be_bytes());
                body.push(port_map.len() as u8);
                body.push(addr_flags(addr) as u8);
                for mapping in port_map {
                    body.extend_from_slice(&mapping.module.to_be_bytes());
                    body.extend_from_slice(&mapping.port.to_be_bytes());
                }
                put_addr(&mut body, addr);
                body.extend_from_slice(hostkey.as_bytes());
            }
            Frame::Ping { tunnel_id, hostkey } | Frame::PingResponse { tunnel_id, hostkey } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(hostkey.as_bytes());
            }
            Frame::NextHopQuery { tunnel_id } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::NextHopResponse { tunnel_id, hostkey } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(&0u16.to_be_bytes());
                body.extend_from_slice(hostkey.as_bytes());
            }
            Frame::FinalHopQuery {
                tunnel_id,
                dest_addr,
                dest_port,
                dest_hostkey,
            } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(&dest_port.to_be_bytes());
                body.extend_from_slice(&addr_flags(dest_addr).to_be_bytes());
                put_addr(&mut body, dest_addr);
                body.extend_from_slice(dest_hostkey.as_bytes());
            }
            Frame::Data {
                tunnel_id,
                hop_tag,
                payload,
            } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(hop_tag);
                body.extend_from_slice(payload);
            }
        }

        let total = body.len() + HEADER_LEN;
        if total > u16::MAX as usize {
            return Err(FrameError::Oversized(total));
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u16).to_be_bytes());
        out.extend_from_slice(&self.tag().to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn addr_flags(addr: &IpAddr) -> u16 {
    match addr {
        IpAddr::V4(_) => 0,
        IpAddr::V6(_) => FLAG_IPV6,
    }
}

fn put_addr(body: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => body.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => body.extend_from_slice(&v6.octets()),
    }
}

/// Bounds-checked cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.buf.len() - self.pos < n {
            return Err(FrameError::Malformed("body ends inside a field"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn addr(&mut self, ipv6: bool) -> Result<IpAddr, FrameError> {
        if ipv6 {
            let octets: [u8; 16] = self.take(16)?.try_into().unwrap();
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        } else {
            let octets: [u8; 4] = self.take(4)?.try_into().unwrap();
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
    }

    /// The remaining bytes as an opaque hostkey.
    fn hostkey(&mut self) -> Hostkey {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        Hostkey::from(rest)
    }

    /// The remaining bytes as a payload buffer.
    fn payload(&mut self) -> Bytes {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        Bytes::copy_from_slice(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: usize) -> Hostkey {
        Hostkey::new((0..n).map(|i| i as u8).collect())
    }

    fn roundtrip(frame: Frame) {
        let bytes = frame.to_bytes().unwrap();
        let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        assert_eq!(declared, bytes.len());
        assert_eq!(Frame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_roundtrip_control_frames() {
        for addr in [
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ] {
            roundtrip(Frame::TunnelBuild {
                dest_addr: addr,
                dest_port: 1400,
                dest_hostkey: key(32),
            });
        }
        roundtrip(Frame::TunnelReady {
            tunnel_id: 0xDEAD_BEEF,
            dest_hostkey: key(32),
        });
        roundtrip(Frame::TunnelIncoming { tunnel_id: 7 });
        roundtrip(Frame::TunnelDestroy { tunnel_id: 42 });
        roundtrip(Frame::TunnelError {
            request_type: TAG_TUNNEL_BUILD,
            tunnel_id: 9,
        });
        roundtrip(Frame::TunnelCover { cover_size: 512 });
    }

    #[test]
    fn test_roundtrip_payload_lengths() {
        for len in [0usize, 1, 16, 1024] {
            let payload = Bytes::from(vec![0x5A; len]);
            roundtrip(Frame::TunnelData {
                tunnel_id: 3,
                payload: payload.clone(),
            });
            roundtrip(Frame::Data {
                tunnel_id: 3,
                hop_tag: [0xAB, 0xCD],
                payload,
            });
        }
    }

    #[test]
    fn test_roundtrip_rps_frames() {
        roundtrip(Frame::RpsQuery);
        for addr in [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
        ] {
            roundtrip(Frame::RpsPeer {
                port: 6000,
                port_map: vec![
                    PortMapping {
                        module: crate::TUNNEL_MODULE,
                        port: 6001,
                    },
                    PortMapping {
                        module: 540,
                        port: 6002,
                    },
                ],
                addr,
                hostkey: key(32),
            });
        }
        roundtrip(Frame::RpsPeer {
            port: 6000,
            port_map: vec![],
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            hostkey: key(0),
        });
    }

    #[test]
    fn test_roundtrip_api_frames() {
        roundtrip(Frame::Ping {
            tunnel_id: 700,
            hostkey: key(32),
        });
        roundtrip(Frame::PingResponse {
            tunnel_id: 700,
            hostkey: key(32),
        });
        roundtrip(Frame::NextHopQuery { tunnel_id: 700 });
        roundtrip(Frame::NextHopResponse {
            tunnel_id: 700,
            hostkey: key(32),
        });
        for addr in [
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ] {
            roundtrip(Frame::FinalHopQuery {
                tunnel_id: 700,
                dest_addr: addr,
                dest_port: 1400,
                dest_hostkey: key(32),
            });
        }
    }

    #[test]
    fn test_golden_destroy_bytes() {
        let bytes = Frame::TunnelDestroy { tunnel_id: 42 }.to_bytes().unwrap();
        assert_eq!(
            bytes,
            vec![0x00, 0x0A, 0x02, 0x33, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A]
        );
    }

    #[test]
    fn test_golden_data_bytes() {
        let bytes = Frame::Data {
            tunnel_id: 7,
            hop_tag: [0xAB, 0xCD],
            payload: Bytes::from_static(&[1, 2, 3]),
        }
        .to_bytes()
        .unwrap();
        assert_eq!(
            bytes,
            vec![0x00, 0x0B, 0x23, 0x2D, 0x00, 0x07, 0xAB, 0xCD, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn test_final_hop_query_hostkey_offset() {
        // The hostkey must start after the 4-byte v4 address (offset 14),
        // or after the 16-byte v6 address (offset 26).
        let v4 = Frame::FinalHopQuery {
            tunnel_id: 5,
            dest_addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            dest_port: 1400,
            dest_hostkey: Hostkey::new(vec![0xAA; 4]),
        }
        .to_bytes()
        .unwrap();
        assert_eq!(&v4[10..14], &[127, 0, 0, 1]);
        assert_eq!(&v4[14..], &[0xAA; 4]);

        let v6 = Frame::FinalHopQuery {
            tunnel_id: 5,
            dest_addr: IpAddr::V6(Ipv6Addr::LOCALHOST),
            dest_port: 1400,
            dest_hostkey: Hostkey::new(vec![0xAA; 4]),
        }
        .to_bytes()
        .unwrap();
        assert_eq!(&v6[26..], &[0xAA; 4]);
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(
            Frame::parse(&[0x00, 0x04, 0xFF, 0xFF]),
            Err(FrameError::UnknownType(0xFFFF))
        );
    }

    #[test]
    fn test_truncated_prefixes() {
        let bytes = Frame::TunnelReady {
            tunnel_id: 1,
            dest_hostkey: key(8),
        }
        .to_bytes()
        .unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(
                Frame::parse(&bytes[..cut]),
                Err(FrameError::Truncated),
                "prefix of {cut} bytes"
            );
        }
    }

    #[test]
    fn test_malformed_bodies() {
        // Declared length shorter than the header itself.
        assert!(matches!(
            Frame::parse(&[0x00, 0x02, 0x02, 0x33]),
            Err(FrameError::Malformed(_))
        ));
        // Ping with a one-byte body cannot hold a tunnel id.
        assert!(matches!(
            Frame::parse(&[0x00, 0x05, 0x23, 0x28, 0x01]),
            Err(FrameError::Malformed(_))
        ));
        // RPS peer declaring more port mappings than it carries.
        assert!(matches!(
            Frame::parse(&[0x00, 0x08, 0x02, 0x1D, 0x17, 0x70, 0x04, 0x00]),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut bytes = Frame::NextHopQuery { tunnel_id: 7 }.to_bytes().unwrap();
        bytes.extend_from_slice(&[0xEE; 3]);
        assert_eq!(
            Frame::parse(&bytes).unwrap(),
            Frame::NextHopQuery { tunnel_id: 7 }
        );
    }

    #[test]
    fn test_oversized_frame() {
        let frame = Frame::TunnelData {
            tunnel_id: 1,
            payload: Bytes::from(vec![0u8; u16::MAX as usize]),
        };
        assert!(matches!(frame.to_bytes(), Err(FrameError::Oversized(_))));
    }
}
