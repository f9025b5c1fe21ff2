// =============================================================================
// Helix — intraday futures trade-lifecycle runtime, main entry point
// =============================================================================
//
// Boot order: env + tracing, config (missing required keys abort with a
// non-zero exit), store, telemetry, notifier, exchange client, execution,
// scheduler. The scheduler owns the trading loop; Ctrl+C stops the process
// between ticks so no trade mutation is left half-applied.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod engines;
mod exchange;
mod execution;
mod guards;
mod heatmap;
mod indicators;
mod manage;
mod ml;
mod notify;
mod regime;
mod scheduler;
mod sizing;
mod store;
mod telemetry;
mod tp_calc;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::exchange::DeltaClient;
use crate::execution::ExecutionEngine;
use crate::notify::Notifier;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::telemetry::Telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Helix Runtime — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Config (fatal on missing required keys) ───────────────────────
    let cfg = Arc::new(Config::from_env()?);
    cfg.log_summary();

    // ── 3. Store + telemetry ─────────────────────────────────────────────
    let store = Arc::new(Store::open(&cfg.db_path)?);
    let tel = Telemetry::new(store.clone());

    // ── 4. Notifier + exchange client ────────────────────────────────────
    let notifier = Arc::new(Notifier::new(
        cfg.tg_bot_token.clone(),
        cfg.tg_chat_id.clone(),
        cfg.tg_min_interval_s,
    ));
    if !notifier.enabled() {
        warn!("telegram credentials missing — notifications disabled");
    }

    let client = Arc::new(DeltaClient::new(
        cfg.delta_base_url.clone(),
        cfg.pair.clone(),
        cfg.delta_api_key.clone(),
        cfg.delta_api_secret.clone(),
    ));

    // ── 5. Execution + scheduler ─────────────────────────────────────────
    let exec = ExecutionEngine::new(client.clone(), store.clone(), tel.clone(), cfg.dry_run);
    let mut scheduler = Scheduler::new(
        cfg.clone(),
        store.clone(),
        client,
        exec,
        tel.clone(),
        notifier.clone(),
    );

    info!(
        pair = %cfg.pair,
        mode = if cfg.dry_run { "PAPER" } else { "LIVE" },
        "all subsystems ready — entering trading loop"
    );

    // ── 6. Trading loop until shutdown ───────────────────────────────────
    tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = result {
                tel.log("run", "FATAL", &e.to_string(), serde_json::json!({}));
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping between ticks");
            tel.log("run", "STOP", "shutdown signal", serde_json::json!({}));
            notifier.send("Trading runtime: shutting down").await;
        }
    }

    info!("Helix runtime shut down complete.");
    Ok(())
}
