//! Time-series point writes.
//!
//! One write contract over two InfluxDB API variants: the 2.x token API and
//! the 1.x host/port/basic-auth API. Both serialize the same line-protocol
//! point for the `redis_queries` measurement; only endpoint and
//! authentication differ, so the consumer never branches on the variant.

use crate::config::InfluxConfig;
use crate::metric::QueryMetric;
use reqwest::Client;

pub const MEASUREMENT: &str = "redis_queries";

/// How much of an error response body to keep for the log line.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug)]
pub enum StoreError {
    Http(reqwest::Error),
    Status { status: u16, body: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Http(e) => write!(f, "time-series write failed: {}", e),
            StoreError::Status { status, body } => {
                write!(f, "time-series store returned {}: {}", status, body)
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Http(e)
    }
}

/// Writes query metrics as points into the configured store variant.
pub struct PointWriter {
    client: Client,
    config: InfluxConfig,
    /// Capture host identity, applied to every point.
    location: String,
}

impl PointWriter {
    pub fn new(config: InfluxConfig, location: String) -> Self {
        PointWriter {
            client: Client::new(),
            config,
            location,
        }
    }

    /// Write one batch of metrics. An empty batch performs no request.
    pub async fn write_points(&self, metrics: &[QueryMetric]) -> Result<(), StoreError> {
        if metrics.is_empty() {
            return Ok(());
        }
        let body = metrics
            .iter()
            .map(|m| line(m, &self.location))
            .collect::<Vec<_>>()
            .join("\n");

        let request = match &self.config {
            InfluxConfig::V2 {
                url,
                token,
                org,
                bucket,
            } => self
                .client
                .post(format!("{}/api/v2/write", url.trim_end_matches('/')))
                .query(&[
                    ("org", org.as_str()),
                    ("bucket", bucket.as_str()),
                    ("precision", "ns"),
                ])
                .header("Authorization", format!("Token {}", token)),
            InfluxConfig::V1 {
                host,
                port,
                protocol,
                database,
                username,
                password,
            } => {
                let mut request = self
                    .client
                    .post(format!("{}://{}:{}/write", protocol, host, port))
                    .query(&[("db", database.as_str()), ("precision", "ns")]);
                if !username.is_empty() {
                    request = request.basic_auth(username, Some(password));
                }
                request
            }
        };

        let response = request.body(body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(ERROR_BODY_LIMIT);
            Err(StoreError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Render one metric as an InfluxDB line-protocol point. No explicit
/// timestamp: the server assigns one at write time.
fn line(metric: &QueryMetric, location: &str) -> String {
    format!(
        "{},command={},operation={},type={},sender={},receiver={},location={} \
         request=\"{}\",start_time={}i,duration_in_ns={}i,size_in_bytes={}i",
        MEASUREMENT,
        escape_tag(&metric.command),
        escape_tag(&metric.operation),
        metric.kind.as_str(),
        escape_tag(&metric.sender),
        escape_tag(&metric.receiver),
        escape_tag(location),
        escape_field(&metric.request),
        metric.start_time,
        metric.duration_ns,
        metric.size_in_bytes,
    )
}

/// Tag values escape commas, equals signs and spaces.
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// String field values escape backslashes and double quotes.
fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
