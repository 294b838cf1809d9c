//! Subscribe to a topic and print every payload.
//!
//! ```sh
//! cargo run -p topic-subscriber --example subscribe -- <HOST:PORT> <TOPIC> [OFFSET]
//! ```
//!
//! Set `TOPIC_SUBSCRIBER_CONFIG` to a YAML file to override the consumer
//! settings (`max_retry_interval_ms`, `max_retries`, ...).
//! Payloads are printed to stdout, one per line; logs go to stderr
//! (`RUST_LOG=topic_subscriber=debug` for connection details).

use topic_subscriber::{Consumer, ConsumerConfig, load_config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let usage = "usage: subscribe <HOST:PORT> <TOPIC> [OFFSET]";
    let host = args.first().ok_or(usage)?;
    let topic = args.get(1).ok_or(usage)?;
    let offset = match args.get(2) {
        Some(raw) => raw.parse::<i64>()?,
        None => -1,
    };

    let config = match std::env::var("TOPIC_SUBSCRIBER_CONFIG") {
        Ok(path) => load_config(std::path::Path::new(&path)).await?,
        Err(_) => ConsumerConfig::default(),
    };

    let consumer = Consumer::with_config(host, config)?;
    eprintln!("subscribing to '{topic}' at {} ...", consumer.registry_endpoint());

    consumer.subscribe_from(topic, offset, |payload| {
        println!("{}", String::from_utf8_lossy(&payload));
    })?;

    tokio::signal::ctrl_c().await?;
    eprintln!(
        "stopping, last offset {}",
        consumer.offset(topic).map_or_else(|| "-".to_string(), |o| o.to_string())
    );
    consumer.close();

    Ok(())
}
