//! Gate Runtime
//!
//! Runs the whole gate in one process:
//! - ingestion loop (poll the chain, retry failed ranges, roll up windows)
//! - approval worker (evaluate finalized windows)
//! - alert loop (ingestion health + provider stats → system alerts)
//!
//! Usage:
//!   cargo run --release --bin gate_runtime
//!
//! Environment variables: see `GateConfig::from_env`. A `.env` file is read
//! when present.

use dotenv::dotenv;
use flowgate::alerts::{AlertEvaluator, AlertStore};
use flowgate::approval::{ApprovalApi, ApprovalWorker, RuleEngine, VerdictStore};
use flowgate::config::GateConfig;
use flowgate::pipeline::aggregates::AggregateStore;
use flowgate::pipeline::ingestion::Ingestor;
use flowgate::pipeline::{SqliteStore, WindowSize};
use flowgate::rpc::ProviderPool;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Gate Runtime");
    info!("   ├─ Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   └─ Mode: ingestion + approval + alerts");

    let config = GateConfig::from_env()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Chain: {}", config.chain);
    info!("   ├─ Providers: {}", config.providers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", "));
    info!("   ├─ Tokens: {}", config.tracked_tokens.iter().map(|t| t.symbol.as_str()).collect::<Vec<_>>().join(", "));
    info!("   ├─ Watch addresses: {}", config.watch_addresses.len());
    info!("   ├─ Confirmations: {} ({}ms blocks)", config.confirmations, config.block_time_ms);
    info!("   ├─ Score bands: APPROVED ≥{}, QUARANTINED ≥{}", config.approved_min_score, config.quarantine_min_score);
    info!("   └─ Database: {}", config.db_path);

    info!("🔧 Initializing database...");
    let store = SqliteStore::open(&config.db_path, &config.schema_dir)?;
    info!("✅ Database initialized");

    let pool = Arc::new(ProviderPool::http(config.providers.clone(), config.pool_config())?);
    let ingestor = Arc::new(Ingestor::new(
        pool.clone(),
        store.clone(),
        config.tracked_tokens.clone(),
        &config.watch_addresses,
        config.ingest_config(),
    ));

    let aggregates: Arc<dyn AggregateStore> = Arc::new(store.clone());
    let verdicts: Arc<dyn VerdictStore> = Arc::new(store.clone());
    let worker = Arc::new(ApprovalWorker::new(
        aggregates.clone(),
        verdicts.clone(),
        RuleEngine::new(config.score_bands()),
        config.tracked_tokens.clone(),
        WindowSize::all().to_vec(),
    ));
    let api = ApprovalApi::new(worker, aggregates, verdicts);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("🚀 Spawning background tasks...");

    // Task 1: Ingestion
    let mut ingest_shutdown = shutdown_rx.clone();
    let ingest_interval = Duration::from_millis(config.ingest_poll_interval_ms);
    let ingest_task = {
        let ingestor = ingestor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ingest_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = now_ms();
                        if let Err(e) = ingestor.poll(now).await {
                            error!("❌ Ingestion poll failed: {}", e);
                        }
                        if let Err(e) = ingestor.retry_failed(now).await {
                            error!("❌ Failed-range retry failed: {}", e);
                        }
                    }
                    _ = ingest_shutdown.changed() => break,
                }
            }
            info!("⏹️  Ingestion loop stopped");
        })
    };
    info!("   ├─ ✅ Ingestion task spawned (every {}ms)", config.ingest_poll_interval_ms);

    // Task 2: Approval worker
    api.start_worker(Duration::from_millis(config.approval_interval_ms)).await;
    info!("   ├─ ✅ Approval worker started (every {}ms)", config.approval_interval_ms);

    // Task 3: Alerts
    let mut alert_shutdown = shutdown_rx.clone();
    let alert_interval = Duration::from_millis(config.alert_interval_ms);
    let evaluator = AlertEvaluator::new(config.alert_thresholds());
    let alert_task = {
        let ingestor = ingestor.clone();
        let pool = pool.clone();
        let alerts = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(alert_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = now_ms();
                        let signals = evaluator.evaluate(&ingestor.health(), &pool.stats(), now);
                        if let Err(e) = alerts.apply(&signals, now).await {
                            error!("❌ Alert evaluation failed: {}", e);
                        }
                    }
                    _ = alert_shutdown.changed() => break,
                }
            }
            info!("⏹️  Alert loop stopped");
        })
    };
    info!("   └─ ✅ Alert task spawned (every {}ms)", config.alert_interval_ms);

    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    // Receivers are still alive, send cannot fail here
    let _ = shutdown_tx.send(true);
    api.stop_worker().await;
    for (name, task) in [("ingestion", ingest_task), ("alerts", alert_task)] {
        if let Err(e) = task.await {
            warn!("⚠️  {} task ended abnormally: {}", name, e);
        }
    }

    match api.stats().await {
        Ok(stats) => info!(
            "📊 Verdicts: {} approved, {} quarantined, {} rejected",
            stats.counts.approved, stats.counts.quarantined, stats.counts.rejected
        ),
        Err(e) => warn!("⚠️  Could not read verdict stats: {}", e),
    }

    let health = ingestor.health();
    info!(
        "📊 Ingestion: last block {:?}, {} failed range(s), head cache {} hits / {} misses",
        health.last_ingested_block, health.ranges_failed_total, health.head_cache_hits, health.head_cache_misses
    );

    info!("✅ Gate runtime stopped");
    Ok(())
}
