#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use redis_tap::capture::{CaptureError, FrameSource, PcapSource, StreamReassembler};
use redis_tap::config::Config;
use redis_tap::correlate::{self, QueryCorrelator};
use redis_tap::emitter::{self, MetricsEmitter};
use std::time::Duration;
use tracing::{error, info};

/// Consecutive capture failures tolerated before the process gives up. A
/// session that keeps erroring (interface gone, permissions revoked) cannot
/// make progress and should die visibly.
const MAX_CONSECUTIVE_ERRORS: u32 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    info!(
        port = config.redis_port,
        interface = %config.interface,
        topic = %config.kafka.topic,
        "starting redis traffic analyzer"
    );

    let emitter = MetricsEmitter::new(&config.kafka)?;
    let correlator = QueryCorrelator::new(emitter.clone());

    tokio::spawn(emitter::run_flush(
        emitter,
        Duration::from_secs(config.flush_interval_secs),
    ));
    tokio::spawn(correlate::run_safety_reset(
        correlator.pending_table(),
        Duration::from_secs(config.pending_reset_interval_secs),
        config.pending_reset_threshold,
    ));

    // Opening the capture session is the only fatal step; from here on every
    // per-frame failure is contained inside the loop.
    let mut source = PcapSource::open(&config.interface, config.redis_port)?;
    let mut reassembler = StreamReassembler::new(config.redis_port);

    let capture = tokio::task::spawn_blocking(move || -> Result<(), CaptureError> {
        let mut consecutive_errors = 0u32;
        loop {
            match source.next_frame() {
                Ok(Some(frame)) => {
                    consecutive_errors = 0;
                    if let Some(message) = reassembler.handle_frame(&frame) {
                        correlator.handle_message(message);
                    }
                }
                Ok(None) => {} // read timeout, poll again
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(e);
                    }
                    error!(error = %e, consecutive_errors, "capture error");
                }
            }
        }
    });
    capture.await??;
    Ok(())
}
