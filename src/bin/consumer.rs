#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use redis_tap::config::Config;
use redis_tap::consumer::MetricsConsumer;
use redis_tap::store::PointWriter;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let location = gethostname::gethostname().to_string_lossy().into_owned();
    info!(topic = %config.kafka.topic, location = %location, "starting metrics consumer");

    let writer = PointWriter::new(config.influx.clone(), location);
    let consumer = MetricsConsumer::new(&config.kafka, writer)?;
    consumer.run().await?;
    Ok(())
}
