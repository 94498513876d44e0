//! Capture session abstraction.
//!
//! The capture loop consumes raw frames through the `FrameSource` trait so
//! the reassembly pipeline can be driven by a live pcap session in
//! production and by canned frames in tests.

use tracing::info;

/// Session-level capture failure. Fatal only when opening the session;
/// read errors are logged by the capture loop and the loop continues.
#[derive(Debug)]
pub enum CaptureError {
    Pcap(pcap::Error),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Pcap(e) => write!(f, "capture session error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<pcap::Error> for CaptureError {
    fn from(e: pcap::Error) -> Self {
        CaptureError::Pcap(e)
    }
}

/// Source of raw link-layer frames.
pub trait FrameSource: Send {
    /// Fetch the next frame. `Ok(None)` means the read timed out with no
    /// frame available; callers should simply poll again.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;
}

/// Live capture on a network interface, filtered to Redis-port TCP traffic.
pub struct PcapSource {
    capture: pcap::Capture<pcap::Active>,
}

impl PcapSource {
    /// Open the interface and install the port filter. Errors here are
    /// startup-fatal for the capture process.
    pub fn open(interface: &str, redis_port: u16) -> Result<Self, CaptureError> {
        let mut capture = pcap::Capture::from_device(interface)?
            .promisc(true)
            .snaplen(65535)
            .timeout(1000)
            .open()?;

        let filter = format!("tcp and port {}", redis_port);
        capture.filter(&filter, true)?;
        info!(interface, filter = %filter, "capture session opened");

        Ok(PcapSource { capture })
    }
}

impl FrameSource for PcapSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Some(packet.data.to_vec())),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(CaptureError::Pcap(e)),
        }
    }
}
