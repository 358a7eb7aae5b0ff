//! Sync engine simulator
//!
//! Runs a scripted editing session against the in-memory persistence
//! backend and change feed, and logs every event the engine publishes:
//! 1. Random field edits across a few open entities
//! 2. Injected network failures and a short offline window
//! 3. Concurrent edits from a simulated second client
//!
//! Usage:
//!   casesync-sim --entities 3 --edits 40 --failure-rate 0.2 --strategy merge

use anyhow::{Context, Result, bail};
use casesync_sync::conflict::merge;
use casesync_sync::feed::mock::MockFeed;
use casesync_sync::persistence::mock::MockPersistence;
use casesync_sync::{
    ConflictStrategy, ManualChoice, NetworkMonitor, SyncConfig, SyncEngine, SyncEvent, WriteError,
};
use casesync_types::{EntityId, Fields, SaveStatus, Snapshot, Version};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

const FIELDS: [&str; 4] = ["customer_name", "phone", "memo", "consent_received"];

#[derive(Parser, Debug)]
#[command(name = "casesync-sim")]
#[command(about = "Simulated editing session for the sync engine")]
struct Args {
    /// Number of entities edited concurrently
    #[arg(short, long, default_value = "3")]
    entities: usize,

    /// Number of local edits to make
    #[arg(long, default_value = "40")]
    edits: usize,

    /// Probability that a write attempt fails with a network error
    #[arg(short, long, default_value = "0.1")]
    failure_rate: f64,

    /// Probability that another client edits the same entity after a local edit
    #[arg(long, default_value = "0.05")]
    remote_rate: f64,

    /// Conflict strategy
    #[arg(short, long, value_enum, default_value = "manual")]
    strategy: Strategy,

    /// Debounce quiet period in milliseconds
    #[arg(long, default_value = "300")]
    debounce_ms: u64,

    /// Seed for the random script
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    Local,
    Remote,
    Merge,
    Manual,
}

impl Strategy {
    fn build(self) -> ConflictStrategy {
        match self {
            Strategy::Local => ConflictStrategy::Local,
            Strategy::Remote => ConflictStrategy::Remote,
            Strategy::Merge => ConflictStrategy::Merge(merge::prefer_local()),
            Strategy::Manual => ConflictStrategy::Manual,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    if !(0.0..=1.0).contains(&args.failure_rate) || !(0.0..=1.0).contains(&args.remote_rate) {
        bail!("rates must be between 0 and 1");
    }
    if args.entities == 0 {
        bail!("need at least one entity");
    }

    info!(
        "Simulating {} edits over {} entities (strategy {:?}, failure rate {})",
        args.edits, args.entities, args.strategy, args.failure_rate
    );

    let feed = MockFeed::new();
    let api = MockPersistence::with_feed(feed.clone());
    let network = NetworkMonitor::default();
    let config = SyncConfig {
        debounce_ms: args.debounce_ms,
        ..SyncConfig::default()
    };
    let engine = Arc::new(
        SyncEngine::new(config, Arc::new(api.clone()), network.clone())
            .with_feed(Arc::new(feed))
            .with_strategy(args.strategy.build()),
    );

    let printer = tokio::spawn(print_events(Arc::clone(&engine)));

    let mut ids = Vec::with_capacity(args.entities);
    for i in 0..args.entities {
        let id = EntityId::new();
        let baseline = Snapshot::new(id, Version::new(1), Fields::new())
            .with_field("customer_name", format!("Customer {}", i + 1));
        api.seed(baseline.clone());
        engine
            .open(baseline)
            .await
            .with_context(|| format!("failed to open entity {id}"))?;
        ids.push(id);
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let offline_at = args.edits / 2;
    for n in 0..args.edits {
        if n == offline_at {
            info!("Dropping the network for two seconds");
            network.set_online(false);
            let network = network.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                network.set_online(true);
            });
        }

        let id = ids[rng.gen_range(0..ids.len())];
        let field = FIELDS[rng.gen_range(0..FIELDS.len())];
        let value = match field {
            "consent_received" => json!(rng.gen_bool(0.5)),
            _ => json!(format!("{field} #{n}")),
        };
        if rng.gen_bool(args.failure_rate) {
            api.fail_next(id, WriteError::Network("simulated drop".into()), 1);
        }
        engine.submit_field_edit(id, field, value).await?;

        if rng.gen_bool(args.remote_rate) {
            let other = FIELDS[rng.gen_range(0..FIELDS.len())];
            let snapshot = api.remote_edit(id, [(other.to_string(), json!("from elsewhere"))].into());
            debug!("Other client wrote {} at {}", other, snapshot.version);
        }

        tokio::time::sleep(Duration::from_millis(rng.gen_range(20..200))).await;
    }

    engine.flush_all().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut global = engine.watch_global_status();
    let settled = matches!(
        tokio::time::timeout(
            Duration::from_secs(30),
            global.wait_for(|s| matches!(s, SaveStatus::Idle | SaveStatus::Saved | SaveStatus::Error)),
        )
        .await,
        Ok(Ok(_))
    );
    if !settled {
        warn!("Engine did not settle within 30s");
    }

    let mut diverged = 0;
    for id in &ids {
        let info = engine.entity_info(*id).await?;
        let server = api.record(id).map(|s| s.fields).unwrap_or_default();
        let local = info.local_view();
        if local != server {
            diverged += 1;
            warn!("Entity {} differs from the server: local {:?}, server {:?}", id, local, server);
        }
        info!(
            "Entity {}: {} at {}, {} queued, conflict {:?}",
            id,
            info.status,
            info.baseline.version,
            info.queued.len(),
            info.conflict_state
        );
    }

    for id in ids {
        engine.close(id).await?;
    }
    engine.shutdown().await;
    printer.abort();

    info!(
        "Done: {} writes sent, {} entities out of sync",
        api.calls().len(),
        diverged
    );
    Ok(())
}

/// Logs every engine event. Manual conflicts are answered with "keep mine".
async fn print_events(engine: Arc<SyncEngine>) {
    let mut events = engine.subscribe();
    loop {
        match events.recv().await {
            Ok(SyncEvent::Conflict(record)) => {
                info!(
                    "Conflict on {} at {}: {:?}",
                    record.entity_id,
                    record.detected_version,
                    record.divergent_fields()
                );
                if matches!(engine.strategy(), ConflictStrategy::Manual) {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        if let Err(e) = engine
                            .resolve_conflict(record.entity_id, ManualChoice::KeepLocal)
                            .await
                        {
                            warn!("Could not resolve conflict: {}", e);
                        }
                    });
                }
            }
            Ok(SyncEvent::StatusChanged { entity_id, status }) => {
                debug!("{} is {}", entity_id, status);
            }
            Ok(event) => info!("{:?}", event),
            Err(RecvError::Lagged(n)) => warn!("Missed {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}
