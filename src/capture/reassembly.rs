//! TCP segment reassembly.
//!
//! Segments are indexed by the sequence number they end at (`seqno + len`).
//! When a push-flagged segment arrives the chain is walked backward through
//! each segment's own starting sequence number until a predecessor is
//! missing, and the walked payloads are concatenated in sequence order into
//! one application message. Chains that never see a push flag stay pending;
//! there is no eviction here.

use super::frame::{decode_frame, CapturedSegment, ConnKey, Direction};
use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;
use std::net::Ipv4Addr;
use tracing::debug;

/// A complete application-layer message recovered from one or more segments.
#[derive(Debug, Clone)]
pub struct ReassembledMessage {
    pub direction: Direction,
    pub conn: ConnKey,
    /// Request: the acknowledgment number carried by the request's first
    /// segment. Response: the first segment's own sequence number. A request
    /// and its response therefore share `(conn, key)`.
    pub key: u32,
    pub bytes: Bytes,
    pub sender: Ipv4Addr,
    pub receiver: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SegmentKey {
    conn: ConnKey,
    direction: Direction,
    next_seqno: u32,
}

/// Best-effort stream reassembler for Redis-port traffic.
pub struct StreamReassembler {
    redis_port: u16,
    segments: FnvHashMap<SegmentKey, CapturedSegment>,
}

impl StreamReassembler {
    pub fn new(redis_port: u16) -> Self {
        StreamReassembler {
            redis_port,
            segments: FnvHashMap::default(),
        }
    }

    /// Number of segments waiting for their chain to complete.
    pub fn pending_segments(&self) -> usize {
        self.segments.len()
    }

    /// Feed one raw link-layer frame.
    ///
    /// Non-TCP, non-IPv4, off-port and payload-free frames are ignored;
    /// malformed frames are logged and dropped. Returns a message when the
    /// frame's push flag completes a chain.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Option<ReassembledMessage> {
        let segment = match decode_frame(frame, self.redis_port) {
            Ok(Some(segment)) => segment,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "dropping undecodable frame");
                return None;
            }
        };
        self.handle_segment(segment)
    }

    /// Insert one decoded segment and attempt reassembly.
    pub fn handle_segment(&mut self, segment: CapturedSegment) -> Option<ReassembledMessage> {
        let conn = segment.conn;
        let direction = segment.direction;
        let push = segment.push;
        let end_seqno = segment.seqno.wrapping_add(segment.payload.len() as u32);

        self.segments.insert(
            SegmentKey {
                conn,
                direction,
                next_seqno: end_seqno,
            },
            segment,
        );

        if !push {
            return None;
        }

        // Last segment of a message: collect the chain back to front.
        let mut chain = Vec::new();
        let mut cursor = end_seqno;
        while let Some(segment) = self.segments.remove(&SegmentKey {
            conn,
            direction,
            next_seqno: cursor,
        }) {
            cursor = segment.seqno;
            chain.push(segment);
        }
        chain.reverse();

        let first = chain.first()?;
        let key = match direction {
            Direction::Request => first.ackno,
            Direction::Response => first.seqno,
        };
        let sender = first.sender;
        let receiver = first.receiver;

        let total: usize = chain.iter().map(|s| s.payload.len()).sum();
        let mut bytes = BytesMut::with_capacity(total);
        for segment in &chain {
            bytes.extend_from_slice(&segment.payload);
        }

        Some(ReassembledMessage {
            direction,
            conn,
            key,
            bytes: bytes.freeze(),
            sender,
            receiver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnKey {
        ConnKey {
            client_addr: Ipv4Addr::new(10, 0, 0, 1),
            client_port: 50000,
            server_addr: Ipv4Addr::new(10, 0, 0, 2),
            server_port: 6379,
        }
    }

    fn segment(seqno: u32, payload: &[u8], push: bool) -> CapturedSegment {
        CapturedSegment {
            conn: conn(),
            direction: Direction::Request,
            seqno,
            ackno: 7000,
            payload: Bytes::copy_from_slice(payload),
            push,
            sender: Ipv4Addr::new(10, 0, 0, 1),
            receiver: Ipv4Addr::new(10, 0, 0, 2),
        }
    }

    #[test]
    fn test_single_segment_message() {
        let mut reassembler = StreamReassembler::new(6379);
        let msg = reassembler.handle_segment(segment(100, b"PING", true)).unwrap();

        assert_eq!(msg.bytes.as_ref(), b"PING");
        assert_eq!(msg.key, 7000);
        assert_eq!(reassembler.pending_segments(), 0);
    }

    #[test]
    fn test_chain_reassembles_in_sequence_order() {
        let mut reassembler = StreamReassembler::new(6379);
        assert!(reassembler.handle_segment(segment(100, b"aaaa", false)).is_none());
        assert!(reassembler.handle_segment(segment(104, b"bbbb", false)).is_none());
        let msg = reassembler.handle_segment(segment(108, b"cc", true)).unwrap();

        assert_eq!(msg.bytes.as_ref(), b"aaaabbbbcc");
        assert_eq!(reassembler.pending_segments(), 0);
    }

    #[test]
    fn test_out_of_order_arrival_still_reassembles() {
        // Middle and first segments swapped; push-flagged tail arrives last.
        let mut reassembler = StreamReassembler::new(6379);
        assert!(reassembler.handle_segment(segment(104, b"bbbb", false)).is_none());
        assert!(reassembler.handle_segment(segment(100, b"aaaa", false)).is_none());
        let msg = reassembler.handle_segment(segment(108, b"cc", true)).unwrap();

        assert_eq!(msg.bytes.as_ref(), b"aaaabbbbcc");
    }

    #[test]
    fn test_chain_without_push_stays_pending() {
        let mut reassembler = StreamReassembler::new(6379);
        assert!(reassembler.handle_segment(segment(100, b"aaaa", false)).is_none());
        assert!(reassembler.handle_segment(segment(104, b"bbbb", false)).is_none());
        assert_eq!(reassembler.pending_segments(), 2);
    }

    #[test]
    fn test_broken_chain_emits_only_the_walkable_suffix() {
        // Segment at 104 never arrives: the walk from the push-flagged tail
        // stops at the gap.
        let mut reassembler = StreamReassembler::new(6379);
        assert!(reassembler.handle_segment(segment(100, b"aaaa", false)).is_none());
        let msg = reassembler.handle_segment(segment(108, b"cc", true)).unwrap();

        assert_eq!(msg.bytes.as_ref(), b"cc");
        assert_eq!(msg.key, 7000);
        assert_eq!(reassembler.pending_segments(), 1);
    }

    #[test]
    fn test_directions_do_not_cross() {
        let mut reassembler = StreamReassembler::new(6379);
        let mut response = segment(100, b"aaaa", false);
        response.direction = Direction::Response;
        assert!(reassembler.handle_segment(response).is_none());

        // Same sequence range in the request direction must not pick up the
        // response segment.
        let msg = reassembler.handle_segment(segment(104, b"bb", true)).unwrap();
        assert_eq!(msg.bytes.as_ref(), b"bb");
        assert_eq!(reassembler.pending_segments(), 1);
    }

    #[test]
    fn test_response_key_is_first_segment_seqno() {
        let mut reassembler = StreamReassembler::new(6379);
        let mut first = segment(500, b"$3\r\n", false);
        first.direction = Direction::Response;
        let mut last = segment(504, b"bar\r\n", true);
        last.direction = Direction::Response;

        assert!(reassembler.handle_segment(first).is_none());
        let msg = reassembler.handle_segment(last).unwrap();
        assert_eq!(msg.key, 500);
        assert_eq!(msg.bytes.as_ref(), b"$3\r\nbar\r\n");
    }
}
