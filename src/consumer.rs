//! Kafka consumer writing metrics into the time-series store.
//!
//! One consumer group member processes messages sequentially, so each
//! partition's metrics reach the store in the order they were produced.
//! Offsets are stored only after the write attempt; a storage failure is
//! logged and the message is still considered consumed.

use crate::config::KafkaConfig;
use crate::metric::QueryMetric;
use crate::store::PointWriter;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use std::time::Duration;
use tracing::{error, info, warn};

/// Consecutive receive failures tolerated before the consumer gives up.
/// Transient broker trouble resolves well inside this; persistent failure
/// means the process cannot make progress and should die visibly.
const MAX_CONSECUTIVE_ERRORS: u32 = 30;

#[derive(Debug)]
pub enum ConsumeError {
    Kafka(KafkaError),
}

impl std::fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumeError::Kafka(e) => write!(f, "kafka consume error: {}", e),
        }
    }
}

impl std::error::Error for ConsumeError {}

impl From<KafkaError> for ConsumeError {
    fn from(e: KafkaError) -> Self {
        ConsumeError::Kafka(e)
    }
}

pub struct MetricsConsumer {
    consumer: StreamConsumer,
    writer: PointWriter,
}

impl MetricsConsumer {
    /// Create the consumer and subscribe. Errors here are startup-fatal.
    pub fn new(config: &KafkaConfig, writer: PointWriter) -> Result<Self, ConsumeError> {
        let mut client_config = config.client_config("redis-metrics-consumer");
        client_config
            .set("group.id", "redis-metrics-consumer-group")
            .set("session.timeout.ms", "180000")
            .set("heartbeat.interval.ms", "3000")
            .set("auto.offset.reset", "earliest")
            .set("allow.auto.create.topics", "true")
            .set("enable.auto.commit", "true")
            // Offsets are stored manually, after the write attempt.
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("max.partition.fetch.bytes", "52429")
            .set("fetch.max.bytes", "524288")
            .set("fetch.wait.max.ms", "30000");

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.topic.as_str()])?;
        info!(topic = %config.topic, "subscribed to metrics topic");

        Ok(MetricsConsumer { consumer, writer })
    }

    /// Consume until the process exits. Returns only when the consumer can
    /// no longer make progress.
    pub async fn run(&self) -> Result<(), ConsumeError> {
        let mut consecutive_errors = 0u32;
        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    consecutive_errors = 0;
                    self.handle(&message).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(ConsumeError::Kafka(e));
                    }
                    error!(error = %e, consecutive_errors, "consumer error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle(&self, message: &BorrowedMessage<'_>) {
        if let Some(payload) = message.payload() {
            match decode_metric(payload) {
                Ok(metric) => {
                    // Write failures do not block the partition; the offset
                    // still advances below.
                    if let Err(e) = self.writer.write_points(std::slice::from_ref(&metric)).await {
                        error!(error = %e, command = %metric.command, "point write failed");
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        offset = message.offset(),
                        "undecodable metric payload, skipping"
                    );
                }
            }
        }
        if let Err(e) = self.consumer.store_offset_from_message(message) {
            error!(error = %e, "failed to store offset");
        }
    }
}

fn decode_metric(payload: &[u8]) -> Result<QueryMetric, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::QueryKind;

    #[test]
    fn test_decode_metric_payload() {
        let payload = br#"{
            "request": "GET foo",
            "command": "GET",
            "operation": "GET foo",
            "type": "user",
            "sender": "10.0.0.1",
            "receiver": "10.0.0.2",
            "start_time": "1700000000000000001",
            "duration_in_ns": "2000000",
            "size_in_bytes": 9
        }"#;
        let metric = decode_metric(payload).unwrap();
        assert_eq!(metric.command, "GET");
        assert_eq!(metric.kind, QueryKind::User);
        assert_eq!(metric.duration_ns, 2_000_000);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_metric(b"not json").is_err());
        assert!(decode_metric(b"{}").is_err());
    }
}
