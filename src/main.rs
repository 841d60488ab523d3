use std::sync::Arc;
use std::time::Duration;

use gridbroker::clock::{Clock, SystemClock};
use gridbroker::config::EngineConfig;
use gridbroker::store::{LibSqlStore, SubtaskStore};
use gridbroker::subtasks::engine::LeaseEngine;
use gridbroker::subtasks::heartbeat::{self, HeartbeatMonitor};
use gridbroker::subtasks::lifecycle::LifecycleEngine;
use gridbroker::subtasks::routes::{EngineState, engine_routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let port: u16 = std::env::var("GRIDBROKER_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let db_path = std::env::var("GRIDBROKER_DB_PATH")
        .unwrap_or_else(|_| "./data/gridbroker.db".to_string());

    let mut config = EngineConfig::default();
    if let Ok(secs) = std::env::var("GRIDBROKER_DEFAULT_GRACE_SECS") {
        if let Ok(secs) = secs.parse() {
            config.default_grace = Duration::from_secs(secs);
        }
    }
    if let Ok(secs) = std::env::var("GRIDBROKER_MAX_GRACE_SECS") {
        if let Ok(secs) = secs.parse() {
            config.max_grace = Duration::from_secs(secs);
        }
    }
    if let Ok(secs) = std::env::var("GRIDBROKER_SWEEP_INTERVAL_SECS") {
        if let Ok(secs) = secs.parse() {
            config.sweep_interval = Duration::from_secs(secs);
        }
    }

    eprintln!("gridbroker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{port}/api");
    eprintln!("   Database: {db_path}");

    // ── Database ─────────────────────────────────────────────────────────
    let db_path_ref = std::path::Path::new(&db_path);
    let store: Arc<dyn SubtaskStore> = Arc::new(
        LibSqlStore::new_local(db_path_ref)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── Engines ──────────────────────────────────────────────────────────
    let lease = Arc::new(LeaseEngine::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.clone(),
    ));
    let monitor = Arc::new(HeartbeatMonitor::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.clone(),
    ));
    let lifecycle = Arc::new(LifecycleEngine::new(
        Arc::clone(&store),
        Arc::clone(&clock),
    ));

    // Background reclaim sweep (first tick fires immediately, recovering
    // leases orphaned by a previous run)
    let _sweep_handle = heartbeat::spawn_reclaim_loop(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.clone(),
    );

    // ── Server ───────────────────────────────────────────────────────────
    let app = engine_routes(EngineState {
        store,
        clock,
        lease,
        monitor,
        lifecycle,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "gridbroker API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
