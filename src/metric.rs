//! Completed-query metric record.
//!
//! One `QueryMetric` is emitted per correlated request/response exchange and
//! travels as a JSON Kafka message. Field names are part of the wire format;
//! the two 64-bit time fields serialize as decimal strings so consumers in
//! double-precision JSON environments cannot lose nanoseconds.

use serde::{Deserialize, Serialize};

/// Query classification: housekeeping traffic vs. application traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    System,
    User,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::System => "system",
            QueryKind::User => "user",
        }
    }
}

/// Observable record of one request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetric {
    /// Space-joined decoded request tokens.
    pub request: String,
    /// Uppercased first token.
    pub command: String,
    /// Command plus its primary argument, when one was present.
    pub operation: String,
    #[serde(rename = "type")]
    pub kind: QueryKind,
    pub sender: String,
    pub receiver: String,
    /// Wall-clock nanoseconds since the epoch at request observation.
    #[serde(with = "string_u64")]
    pub start_time: u64,
    #[serde(rename = "duration_in_ns", with = "string_u64")]
    pub duration_ns: u64,
    pub size_in_bytes: u64,
}

mod string_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
