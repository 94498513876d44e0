//! Transport header decoding for captured frames.

use bytes::Bytes;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::Ipv4Addr;

/// Which way a segment travels relative to the observed Redis server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

/// Canonicalized connection tuple.
///
/// Requests and responses of one connection normalize to the same key: the
/// endpoint owning the Redis port is always the server side. Scoping the
/// reassembly and pending-query tables by this tuple keeps concurrent
/// connections with overlapping sequence ranges from colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub client_addr: Ipv4Addr,
    pub client_port: u16,
    pub server_addr: Ipv4Addr,
    pub server_port: u16,
}

impl ConnKey {
    fn new(
        direction: Direction,
        saddr: Ipv4Addr,
        daddr: Ipv4Addr,
        sport: u16,
        dport: u16,
    ) -> Self {
        match direction {
            Direction::Request => ConnKey {
                client_addr: saddr,
                client_port: sport,
                server_addr: daddr,
                server_port: dport,
            },
            Direction::Response => ConnKey {
                client_addr: daddr,
                client_port: dport,
                server_addr: saddr,
                server_port: sport,
            },
        }
    }
}

/// One payload-bearing TCP segment on the Redis port.
#[derive(Debug, Clone)]
pub struct CapturedSegment {
    pub conn: ConnKey,
    pub direction: Direction,
    pub seqno: u32,
    pub ackno: u32,
    pub payload: Bytes,
    pub push: bool,
    pub sender: Ipv4Addr,
    pub receiver: Ipv4Addr,
}

/// Malformed transport headers. The offending frame is dropped; capture
/// continues.
#[derive(Debug)]
pub struct FrameDecodeError(etherparse::err::packet::SliceError);

impl std::fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed frame: {:?}", self.0)
    }
}

impl std::error::Error for FrameDecodeError {}

/// Decode one link-layer frame into a Redis-port TCP segment.
///
/// Returns `Ok(None)` for frames that are not IPv4/TCP, are not on the Redis
/// port in either direction, or carry no payload.
pub fn decode_frame(
    frame: &[u8],
    redis_port: u16,
) -> Result<Option<CapturedSegment>, FrameDecodeError> {
    let sliced = SlicedPacket::from_ethernet(frame).map_err(FrameDecodeError)?;

    let ipv4 = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => ipv4.header(),
        _ => return Ok(None),
    };
    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(header)) => header,
        _ => return Ok(None),
    };

    let sport = tcp.source_port();
    let dport = tcp.destination_port();
    let direction = if dport == redis_port {
        Direction::Request
    } else if sport == redis_port {
        Direction::Response
    } else {
        return Ok(None);
    };

    let payload = tcp.payload();
    if payload.is_empty() {
        return Ok(None);
    }

    let saddr = ipv4.source_addr();
    let daddr = ipv4.destination_addr();
    Ok(Some(CapturedSegment {
        conn: ConnKey::new(direction, saddr, daddr, sport, dport),
        direction,
        seqno: tcp.sequence_number(),
        ackno: tcp.acknowledgment_number(),
        payload: Bytes::copy_from_slice(payload),
        push: tcp.psh(),
        sender: saddr,
        receiver: daddr,
    }))
}
