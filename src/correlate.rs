//! Request/response correlation.
//!
//! Reassembled requests park in a pending table keyed by connection tuple
//! plus acknowledgment number; the matching response arrives keyed by its own
//! sequence number and closes the exchange. Undecodable requests leave an
//! explicit sentinel so their responses are discarded instead of
//! mis-attributed. A periodic safety reset bounds the table when responses
//! go missing at scale.

use crate::capture::{ConnKey, Direction, ReassembledMessage};
use crate::metric::{QueryKind, QueryMetric};
use crate::resp::RespParser;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Commands classified as `system`: connection housekeeping rather than
/// application traffic.
pub const SYSTEM_COMMANDS: [&str; 6] = ["CLIENT", "CLUSTER", "INFO", "READONLY", "HELLO", "PING"];

/// Destination for completed-query metrics.
pub trait MetricSink: Send + Sync {
    fn record(&self, metric: QueryMetric);
}

/// One in-flight request awaiting its response.
#[derive(Debug, Clone)]
struct PendingQuery {
    request: String,
    command: String,
    operation: String,
    kind: QueryKind,
    sender: String,
    receiver: String,
    started: Instant,
    start_time: u64,
}

type PendingKey = (ConnKey, u32);

/// Shared handle to the pending-query table.
///
/// `None` entries are the unparseable-request sentinel: a request arrived at
/// that key but could not be decoded, so the eventual response must be
/// dropped without emitting a metric.
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<FnvHashMap<PendingKey, Option<PendingQuery>>>>,
}

impl PendingTable {
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the table wholesale if it outgrew `threshold`.
    ///
    /// This deliberately trades away in-flight correlations for bounded
    /// memory. Returns the number of dropped entries.
    pub fn reset_if_oversized(&self, threshold: usize) -> usize {
        let mut table = self.inner.lock();
        let pending = table.len();
        if pending > threshold {
            *table = FnvHashMap::default();
            drop(table);
            warn!(dropped = pending, threshold, "pending query table cleared");
            pending
        } else {
            debug!(pending, "pending query table size");
            0
        }
    }
}

/// Matches requests to responses and emits one metric per completed
/// exchange.
pub struct QueryCorrelator<S> {
    pending: PendingTable,
    sink: S,
}

impl<S: MetricSink> QueryCorrelator<S> {
    pub fn new(sink: S) -> Self {
        QueryCorrelator {
            pending: PendingTable::default(),
            sink,
        }
    }

    /// Handle to the pending table, for the periodic safety reset.
    pub fn pending_table(&self) -> PendingTable {
        self.pending.clone()
    }

    pub fn handle_message(&self, message: ReassembledMessage) {
        match message.direction {
            Direction::Request => self.on_request(message),
            Direction::Response => self.on_response(message),
        }
    }

    fn on_request(&self, message: ReassembledMessage) {
        let key = (message.conn, message.key);
        let entry = decode_request(&message);
        if entry.is_none() {
            debug!(key = message.key, "request did not decode, parking sentinel");
        }
        self.pending.inner.lock().insert(key, entry);
    }

    fn on_response(&self, message: ReassembledMessage) {
        let key = (message.conn, message.key);
        let removed = self.pending.inner.lock().remove(&key);
        match removed {
            // No request observed at this key: traffic outside the
            // observation window. Not an error.
            None => {}
            // Sentinel: the request never decoded, discard silently.
            Some(None) => {}
            Some(Some(query)) => {
                let metric = QueryMetric {
                    request: query.request,
                    command: query.command,
                    operation: query.operation,
                    kind: query.kind,
                    sender: query.sender,
                    receiver: query.receiver,
                    start_time: query.start_time,
                    duration_ns: query.started.elapsed().as_nanos() as u64,
                    size_in_bytes: message.bytes.len() as u64,
                };
                self.sink.record(metric);
            }
        }
    }
}

/// Decode a request message into a pending entry; `None` is the sentinel.
fn decode_request(message: &ReassembledMessage) -> Option<PendingQuery> {
    let (value, _) = RespParser::parse(&message.bytes).ok()?;
    let tokens = value.command_tokens()?;
    let first = tokens.first()?;

    let command = first.to_uppercase();
    let operation = match tokens.get(1) {
        Some(arg) => format!("{} {}", command, arg),
        None => command.clone(),
    };
    let kind = if SYSTEM_COMMANDS.contains(&command.as_str()) {
        QueryKind::System
    } else {
        QueryKind::User
    };

    Some(PendingQuery {
        request: tokens.join(" "),
        command,
        operation,
        kind,
        sender: message.sender.to_string(),
        receiver: message.receiver.to_string(),
        started: Instant::now(),
        start_time: epoch_nanos(),
    })
}

fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Periodic safety valve for the pending table. Runs until the process
/// exits.
pub async fn run_safety_reset(table: PendingTable, period: Duration, threshold: usize) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        table.reset_if_oversized(threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    #[derive(Clone, Default)]
    struct RecordingSink {
        metrics: Arc<Mutex<Vec<QueryMetric>>>,
    }

    impl MetricSink for RecordingSink {
        fn record(&self, metric: QueryMetric) {
            self.metrics.lock().push(metric);
        }
    }

    impl RecordingSink {
        fn take(&self) -> Vec<QueryMetric> {
            std::mem::take(&mut self.metrics.lock())
        }
    }

    fn conn() -> ConnKey {
        ConnKey {
            client_addr: Ipv4Addr::new(10, 0, 0, 1),
            client_port: 50000,
            server_addr: Ipv4Addr::new(10, 0, 0, 2),
            server_port: 6379,
        }
    }

    fn message(direction: Direction, key: u32, bytes: &[u8]) -> ReassembledMessage {
        ReassembledMessage {
            direction,
            conn: conn(),
            key,
            bytes: Bytes::copy_from_slice(bytes),
            sender: Ipv4Addr::new(10, 0, 0, 1),
            receiver: Ipv4Addr::new(10, 0, 0, 2),
        }
    }

    #[test]
    fn test_request_then_response_emits_one_metric() {
        let sink = RecordingSink::default();
        let correlator = QueryCorrelator::new(sink.clone());

        correlator.handle_message(message(
            Direction::Request,
            100,
            b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n",
        ));
        correlator.handle_message(message(Direction::Response, 100, b"$3\r\nbar\r\n"));

        let metrics = sink.take();
        assert_eq!(metrics.len(), 1);
        let metric = &metrics[0];
        assert_eq!(metric.command, "GET");
        assert_eq!(metric.operation, "GET foo");
        assert_eq!(metric.request, "GET foo");
        assert_eq!(metric.kind, QueryKind::User);
        assert_eq!(metric.size_in_bytes, 9);
        assert!(metric.start_time > 0);
        assert!(correlator.pending_table().is_empty());
    }

    #[test]
    fn test_unparseable_request_discards_its_response() {
        let sink = RecordingSink::default();
        let correlator = QueryCorrelator::new(sink.clone());

        correlator.handle_message(message(Direction::Request, 7, b"not resp at all"));
        assert_eq!(correlator.pending_table().len(), 1);

        correlator.handle_message(message(Direction::Response, 7, b"+OK\r\n"));
        assert!(sink.take().is_empty());
        assert!(correlator.pending_table().is_empty());
    }

    #[test]
    fn test_response_without_request_is_ignored() {
        let sink = RecordingSink::default();
        let correlator = QueryCorrelator::new(sink.clone());

        correlator.handle_message(message(Direction::Response, 9, b"+OK\r\n"));
        assert!(sink.take().is_empty());
        assert!(correlator.pending_table().is_empty());
    }

    #[test]
    fn test_system_command_classification() {
        let sink = RecordingSink::default();
        let correlator = QueryCorrelator::new(sink.clone());

        correlator.handle_message(message(Direction::Request, 1, b"*1\r\n$4\r\nping\r\n"));
        correlator.handle_message(message(Direction::Response, 1, b"+PONG\r\n"));

        let metrics = sink.take();
        assert_eq!(metrics[0].command, "PING");
        assert_eq!(metrics[0].kind, QueryKind::System);
        // No argument token: operation is the bare command.
        assert_eq!(metrics[0].operation, "PING");
    }

    #[test]
    fn test_empty_command_array_parks_sentinel() {
        let sink = RecordingSink::default();
        let correlator = QueryCorrelator::new(sink.clone());

        correlator.handle_message(message(Direction::Request, 3, b"*0\r\n"));
        correlator.handle_message(message(Direction::Response, 3, b"+OK\r\n"));
        assert!(sink.take().is_empty());
        assert!(correlator.pending_table().is_empty());
    }

    #[test]
    fn test_duration_is_monotonic_elapsed() {
        let sink = RecordingSink::default();
        let correlator = QueryCorrelator::new(sink.clone());

        correlator.handle_message(message(Direction::Request, 5, b"*1\r\n$4\r\nINFO\r\n"));
        std::thread::sleep(Duration::from_millis(2));
        correlator.handle_message(message(Direction::Response, 5, b"$2\r\nok\r\n"));

        let metrics = sink.take();
        assert!(metrics[0].duration_ns >= 2_000_000);
    }

    #[test]
    fn test_reset_clears_only_past_threshold() {
        let sink = RecordingSink::default();
        let correlator = QueryCorrelator::new(sink);
        let table = correlator.pending_table();

        for key in 0..4 {
            correlator.handle_message(message(Direction::Request, key, b"*1\r\n$4\r\nPING\r\n"));
        }
        assert_eq!(table.reset_if_oversized(10), 0);
        assert_eq!(table.len(), 4);

        assert_eq!(table.reset_if_oversized(3), 4);
        assert!(table.is_empty());
    }
}
