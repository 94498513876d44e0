//! Metric batching and Kafka publish.
//!
//! Completed-query metrics accumulate in an in-memory batch; a fixed timer
//! drives `flush`, which takes the batch atomically and publishes each
//! metric as a JSON message keyed by its command name. The producer
//! compresses message sets with gzip and retries transient transport errors
//! with capped exponential backoff; a batch whose delivery still fails is
//! logged and dropped. Metrics are telemetry, not transactional data.

use crate::config::KafkaConfig;
use crate::correlate::MetricSink;
use crate::metric::QueryMetric;
use futures::future;
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// How long `send` may wait for space in the local producer queue. Delivery
/// itself is bounded by `message.timeout.ms`.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum EmitError {
    Kafka(KafkaError),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmitError::Kafka(e) => write!(f, "kafka publish error: {}", e),
            EmitError::Serialize(e) => write!(f, "metric serialization error: {}", e),
        }
    }
}

impl std::error::Error for EmitError {}

impl From<KafkaError> for EmitError {
    fn from(e: KafkaError) -> Self {
        EmitError::Kafka(e)
    }
}

impl From<serde_json::Error> for EmitError {
    fn from(e: serde_json::Error) -> Self {
        EmitError::Serialize(e)
    }
}

/// Buffers completed-query metrics and publishes them in batches.
///
/// Cheap to clone; all clones share one batch and one producer.
#[derive(Clone)]
pub struct MetricsEmitter {
    batch: Arc<Mutex<Vec<QueryMetric>>>,
    producer: FutureProducer,
    topic: String,
}

impl MetricsEmitter {
    pub fn new(config: &KafkaConfig) -> Result<Self, EmitError> {
        let mut client_config = config.client_config("redis-metrics-producer");
        client_config
            .set("compression.type", "gzip")
            .set("message.timeout.ms", "60000")
            .set("message.send.max.retries", "2147483647")
            .set("retry.backoff.ms", "300")
            .set("retry.backoff.max.ms", "30000");

        let producer = client_config.create()?;
        Ok(MetricsEmitter {
            batch: Arc::new(Mutex::new(Vec::new())),
            producer,
            topic: config.topic.clone(),
        })
    }

    /// Number of metrics waiting in the current batch.
    pub fn batch_len(&self) -> usize {
        self.batch.lock().len()
    }

    /// Atomically take the current batch, leaving an empty one behind.
    ///
    /// A `record` racing with this lands in exactly one of the two batches.
    pub fn take_batch(&self) -> Vec<QueryMetric> {
        std::mem::take(&mut *self.batch.lock())
    }

    /// Publish the current batch. An empty batch performs no publish call;
    /// a failed publish drops the batch after logging.
    pub async fn flush(&self) {
        let batch = self.take_batch();
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        match self.publish(&batch).await {
            Ok(()) => debug!(count, "published metrics batch"),
            Err(e) => error!(error = %e, dropped = count, "failed to publish metrics batch"),
        }
    }

    async fn publish(&self, batch: &[QueryMetric]) -> Result<(), EmitError> {
        let mut messages = Vec::with_capacity(batch.len());
        for metric in batch {
            messages.push((metric.command.as_str(), serde_json::to_vec(metric)?));
        }

        let deliveries = messages.iter().map(|(key, payload)| {
            self.producer.send(
                FutureRecord::to(&self.topic).key(*key).payload(payload),
                Timeout::After(ENQUEUE_TIMEOUT),
            )
        });

        let mut first_error = None;
        for result in future::join_all(deliveries).await {
            if let Err((e, _message)) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(EmitError::Kafka(e)),
        }
    }
}

impl MetricSink for MetricsEmitter {
    /// Append to the current batch. Non-blocking; safe on the capture path.
    fn record(&self, metric: QueryMetric) {
        self.batch.lock().push(metric);
    }
}

/// Fixed-interval flush driver. Runs until the process exits.
pub async fn run_flush(emitter: MetricsEmitter, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        debug!(pending = emitter.batch_len(), "flush tick");
        emitter.flush().await;
    }
}
