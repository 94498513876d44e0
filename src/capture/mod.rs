//! Packet capture and TCP stream reassembly.
//!
//! The capture session delivers raw link-layer frames; `decode_frame` lifts
//! them into Redis-port TCP segments and `StreamReassembler` stitches the
//! segments back into complete application messages, using the TCP push flag
//! as the end-of-message marker.

mod frame;
mod reassembly;
mod source;

pub use frame::{decode_frame, CapturedSegment, ConnKey, Direction, FrameDecodeError};
pub use reassembly::{ReassembledMessage, StreamReassembler};
pub use source::{CaptureError, FrameSource, PcapSource};
