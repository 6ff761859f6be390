//! stash-soak - Concurrency soak test for the stash buffers
//!
//! Runs many producers against a BatchBuffer and a KeyedCounterAggregator
//! whose sinks are deliberately slow, then checks that every item arrived
//! exactly once and that the delivered counter totals match the increments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use elohim_stash::{
    buffer::PoolStats, config::Args, sink_fn, Batch, BatchBuffer, BatchBufferConfig,
    CounterAggregatorConfig, CounterEntry, FlushStats, KeyedCounterAggregator,
};

#[derive(Debug, Serialize)]
struct SoakReport {
    producers: usize,
    duration_secs: u64,
    elapsed_ms: u64,
    items_produced: u64,
    items_delivered: u64,
    increments: u64,
    counter_total_delivered: i64,
    buffer: FlushStats,
    counters: FlushStats,
    pool: PoolStats,
    lossless: bool,
}

struct ProducerOutcome {
    produced: u64,
    increments: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("elohim_stash={},stash_soak={},info", log_level, log_level).into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  stash-soak - aggregation soak test");
    info!("======================================");
    info!("Producers: {}", args.producers);
    info!("Duration: {}s", args.duration_secs);
    info!("Batch limit: {}", args.limit);
    info!("Flush interval: {:?}", args.flush_interval());
    info!("Sink latency: {}ms", args.sink_latency_ms);
    info!("Counter keys: {}", args.keys);
    info!("======================================");

    let sink_latency = Duration::from_millis(args.sink_latency_ms);

    let delivered = Arc::new(AtomicU64::new(0));
    let buffer = {
        let delivered = Arc::clone(&delivered);
        BatchBuffer::new(
            BatchBufferConfig {
                limit: args.limit,
                flush_interval: args.flush_interval(),
            },
            sink_fn(move |batch: Batch<u64>| {
                let delivered = Arc::clone(&delivered);
                async move {
                    tokio::time::sleep(sink_latency).await;
                    delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    Ok(())
                }
            }),
        )?
    };
    let buffer = Arc::new(buffer);

    let totals: Arc<DashMap<String, i64>> = Arc::new(DashMap::new());
    let counters = {
        let totals = Arc::clone(&totals);
        KeyedCounterAggregator::new(
            CounterAggregatorConfig {
                limit: (args.keys / 2).max(1),
                flush_interval: args.flush_interval(),
            },
            sink_fn(move |batch: Batch<CounterEntry<String>>| {
                let totals = Arc::clone(&totals);
                async move {
                    tokio::time::sleep(sink_latency).await;
                    for entry in &batch {
                        *totals.entry(entry.key.clone()).or_insert(0) += entry.value;
                    }
                    Ok(())
                }
            }),
        )?
    };
    let counters = Arc::new(counters);

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration_secs);

    let mut producers = Vec::with_capacity(args.producers);
    for producer in 0..args.producers {
        let (buffer, counters) = (Arc::clone(&buffer), Arc::clone(&counters));
        let keys = args.keys;
        producers.push(tokio::spawn(async move {
            let mut outcome = ProducerOutcome {
                produced: 0,
                increments: 0,
            };
            let mut seq: u64 = 0;

            while Instant::now() < deadline {
                buffer.put(((producer as u64) << 40) | seq).await?;
                outcome.produced += 1;

                let (key, pause) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(0..keys), rng.gen_range(0..=2u64))
                };
                counters.increment(format!("key-{}", key)).await?;
                outcome.increments += 1;

                seq += 1;
                if seq % 64 == 0 {
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
            }
            anyhow::Ok(outcome)
        }));
    }

    let mut produced = 0;
    let mut increments = 0;
    for producer in producers {
        let outcome = producer.await??;
        produced += outcome.produced;
        increments += outcome.increments;
    }

    info!("Producers finished, shutting down buffers");
    buffer.shutdown().await?;
    counters.shutdown().await?;

    let items_delivered = delivered.load(Ordering::Relaxed);
    let counter_total_delivered: i64 = totals.iter().map(|entry| *entry.value()).sum();
    let lossless = items_delivered == produced && counter_total_delivered == increments as i64;

    let report = SoakReport {
        producers: args.producers,
        duration_secs: args.duration_secs,
        elapsed_ms: started.elapsed().as_millis() as u64,
        items_produced: produced,
        items_delivered,
        increments,
        counter_total_delivered,
        buffer: buffer.stats(),
        counters: counters.stats(),
        pool: buffer.pool().stats(),
        lossless,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !lossless {
        error!(
            produced,
            items_delivered, increments, counter_total_delivered, "Soak test detected lost or duplicated data"
        );
        std::process::exit(1);
    }

    info!(
        produced,
        flushes = report.buffer.flushes,
        pool_reuse = format!("{:.1}%", report.pool.reuse_rate()),
        "Soak test passed"
    );
    Ok(())
}
