use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use statarb::config::StatArbConfig;
use statarb::engine::StatArbEngine;
use statarb::ports::paper_broker::{PaperBroker, ReplayFeed};
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    log::info!("Starting stat-arb loop...");
    let cfg = StatArbConfig::from_env_or_yaml().expect("invalid statarb config");

    let (fill_tx, fill_rx) = mpsc::channel(cfg.tick_queue_depth);
    let (tick_tx, tick_rx) = mpsc::channel(cfg.tick_queue_depth);

    let replay_path = env::var("STATARB_REPLAY_FILE")
        .expect("STATARB_REPLAY_FILE must point at a JSONL price dump");
    let feed = ReplayFeed::from_jsonl_path(&replay_path).expect("invalid replay file");
    log::info!("Replaying {} timesteps from {}", feed.len(), replay_path);

    let broker = Arc::new(PaperBroker::new(fill_tx));
    let engine = StatArbEngine::new(cfg, broker.clone());

    let producer = tokio::spawn(feed.run(broker, tick_tx));
    let result = engine.run(tick_rx, fill_rx).await;
    let _ = producer.await;
    result.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}
