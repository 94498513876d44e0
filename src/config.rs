//! Environment-driven configuration.
//!
//! Every knob is optional and carries a default, so the analyzer runs
//! against a local stack with no environment at all.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `REDIS_PORT` | `6379` | Redis port to filter on |
//! | `NETWORK_INTERFACE` | `lo0` | Capture interface |
//! | `KAFKA_BROKERS` | `localhost:9092` | Comma-separated broker list |
//! | `KAFKA_TOPIC` | `redis-query-metrics` | Metrics topic |
//! | `KAFKA_SSL_CA` | unset | Base64 PEM CA certificate |
//! | `KAFKA_SSL_CERT` | unset | Base64 PEM client certificate |
//! | `KAFKA_SSL_KEY` | unset | Base64 PEM client key |
//! | `INFLUX_DB_VERSION` | `2.x` | `2.x` selects the token API, anything else the 1.x API |
//! | `INFLUX_DB_URL` | `http://localhost:8086` | 2.x base URL |
//! | `INFLUX_DB_TOKEN` / `INFLUX_DB_ORG` / `INFLUX_DB_BUCKET` | empty / `localorg` / `localbucket` | 2.x credentials |
//! | `INFLUX_DB_HOST` / `INFLUX_DB_PORT` / `INFLUX_DB_PROTOCOL` | `localhost` / `8086` / `http` | 1.x endpoint |
//! | `INFLUX_DB_DATABASE` / `INFLUX_DB_USERNAME` / `INFLUX_DB_PASSWORD` | `redis_metrics` / empty / empty | 1.x credentials |
//! | `METRICS_FLUSH_INTERVAL_SECS` | `15` | Batch publish period |
//! | `PENDING_RESET_INTERVAL_SECS` | `60` | Safety-reset check period |
//! | `PENDING_RESET_THRESHOLD` | `10000` | Pending-query count that triggers a reset |

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rdkafka::config::ClientConfig;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_port: u16,
    pub interface: String,
    pub kafka: KafkaConfig,
    pub influx: InfluxConfig,
    pub flush_interval_secs: u64,
    pub pending_reset_interval_secs: u64,
    pub pending_reset_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topic: String,
    pub tls: KafkaTls,
}

impl KafkaConfig {
    /// Base librdkafka configuration shared by the producer and the
    /// consumer, with broker list and TLS material applied.
    pub fn client_config(&self, client_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", client_id)
            .set("metadata.max.age.ms", "300000");
        if self.tls.is_enabled() {
            config.set("security.protocol", "ssl");
            if let Some(ca) = &self.tls.ca_pem {
                config.set("ssl.ca.pem", ca);
            }
            if let Some(cert) = &self.tls.cert_pem {
                config.set("ssl.certificate.pem", cert);
            }
            if let Some(key) = &self.tls.key_pem {
                config.set("ssl.key.pem", key);
            }
        }
        config
    }
}

/// TLS material for the broker connection, each piece independently
/// optional. Supplied base64-encoded in the environment; stored as PEM.
#[derive(Debug, Clone, Default)]
pub struct KafkaTls {
    pub ca_pem: Option<String>,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
}

impl KafkaTls {
    pub fn is_enabled(&self) -> bool {
        self.ca_pem.is_some() || self.cert_pem.is_some() || self.key_pem.is_some()
    }
}

/// Time-series store endpoint, in one of the two supported API variants.
#[derive(Debug, Clone)]
pub enum InfluxConfig {
    V2 {
        url: String,
        token: String,
        org: String,
        bucket: String,
    },
    V1 {
        host: String,
        port: u16,
        protocol: String,
        database: String,
        username: String,
        password: String,
    },
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            redis_port: env_parse("REDIS_PORT", 6379),
            interface: env_or("NETWORK_INTERFACE", "lo0"),
            kafka: KafkaConfig {
                brokers: env_or("KAFKA_BROKERS", "localhost:9092"),
                topic: env_or("KAFKA_TOPIC", "redis-query-metrics"),
                tls: KafkaTls {
                    ca_pem: env_pem("KAFKA_SSL_CA"),
                    cert_pem: env_pem("KAFKA_SSL_CERT"),
                    key_pem: env_pem("KAFKA_SSL_KEY"),
                },
            },
            influx: influx_from_env(),
            flush_interval_secs: env_parse("METRICS_FLUSH_INTERVAL_SECS", 15),
            pending_reset_interval_secs: env_parse("PENDING_RESET_INTERVAL_SECS", 60),
            pending_reset_threshold: env_parse("PENDING_RESET_THRESHOLD", 10_000),
        }
    }
}

fn influx_from_env() -> InfluxConfig {
    if env_or("INFLUX_DB_VERSION", "2.x") == "2.x" {
        InfluxConfig::V2 {
            url: env_or("INFLUX_DB_URL", "http://localhost:8086"),
            token: env_or("INFLUX_DB_TOKEN", ""),
            org: env_or("INFLUX_DB_ORG", "localorg"),
            bucket: env_or("INFLUX_DB_BUCKET", "localbucket"),
        }
    } else {
        InfluxConfig::V1 {
            host: env_or("INFLUX_DB_HOST", "localhost"),
            port: env_parse("INFLUX_DB_PORT", 8086),
            protocol: env_or("INFLUX_DB_PROTOCOL", "http"),
            database: env_or("INFLUX_DB_DATABASE", "redis_metrics"),
            username: env_or("INFLUX_DB_USERNAME", ""),
            password: env_or("INFLUX_DB_PASSWORD", ""),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable, falling back to the default (with a
/// warning) on unparseable values.
fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, %default, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Read base64-encoded PEM material; invalid encodings are ignored with a
/// warning rather than failing startup.
fn env_pem(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    match BASE64.decode(raw.trim()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(pem) => Some(pem),
            Err(_) => {
                warn!(key, "decoded value is not UTF-8 PEM, ignoring");
                None
            }
        },
        Err(e) => {
            warn!(key, error = %e, "invalid base64, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_environment() {
        // from_env must never panic regardless of the ambient environment.
        let config = Config::from_env();
        assert!(!config.kafka.topic.is_empty());
        assert!(config.flush_interval_secs > 0);
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        env::set_var("REDIS_TAP_TEST_PORT_GARBAGE", "not-a-number");
        assert_eq!(env_parse("REDIS_TAP_TEST_PORT_GARBAGE", 6379u16), 6379);
        env::remove_var("REDIS_TAP_TEST_PORT_GARBAGE");
    }

    #[test]
    fn test_env_pem_round_trip() {
        env::set_var("REDIS_TAP_TEST_PEM", BASE64.encode("-----BEGIN CERT-----"));
        assert_eq!(
            env_pem("REDIS_TAP_TEST_PEM").as_deref(),
            Some("-----BEGIN CERT-----")
        );
        env::remove_var("REDIS_TAP_TEST_PEM");

        env::set_var("REDIS_TAP_TEST_PEM_BAD", "!!! not base64 !!!");
        assert_eq!(env_pem("REDIS_TAP_TEST_PEM_BAD"), None);
        env::remove_var("REDIS_TAP_TEST_PEM_BAD");
    }

    #[test]
    fn test_tls_enabled_when_any_piece_present() {
        let mut tls = KafkaTls::default();
        assert!(!tls.is_enabled());
        tls.ca_pem = Some("pem".to_string());
        assert!(tls.is_enabled());
    }

    #[test]
    fn test_client_config_applies_tls_only_when_present() {
        let mut kafka = KafkaConfig {
            brokers: "localhost:9092".to_string(),
            topic: "redis-query-metrics".to_string(),
            tls: KafkaTls::default(),
        };
        let plain = kafka.client_config("test-client");
        assert_eq!(plain.get("bootstrap.servers"), Some("localhost:9092"));
        assert!(plain.get("security.protocol").is_none());

        kafka.tls.ca_pem = Some("pem".to_string());
        let secured = kafka.client_config("test-client");
        assert_eq!(secured.get("security.protocol"), Some("ssl"));
        assert_eq!(secured.get("ssl.ca.pem"), Some("pem"));
    }
}
