use anyhow::Result;
use std::{sync::Arc, time::Duration};

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = selfray::config::Cli::parse();
    let cmd = cli.command.clone().unwrap_or(selfray::config::Command::Run);

    match cmd {
        selfray::config::Command::Run => run_server(cli.config).await,
        selfray::config::Command::HashAdminToken(args) => hash_admin_token(&args),
    }
}

fn hash_admin_token(args: &selfray::config::HashAdminTokenArgs) -> Result<()> {
    let hash = selfray::admin_token::hash_admin_token(&args.token)
        .map_err(|e| anyhow::anyhow!("hash admin token: {e}"))?;
    println!("{}", hash.as_str());
    Ok(())
}

async fn run_server(config: selfray::config::Config) -> Result<()> {
    if config.admin_token_hash().is_none() {
        warn!("no valid --admin-token-hash configured; all admin API requests will be rejected");
    }

    let store = selfray::store::SqliteStore::open(&config.db_path())?;
    let store = Arc::new(Mutex::new(store));

    let engine = selfray::engine::EngineSupervisor::new(
        config.engine_bin.clone(),
        config.engine_config_path(),
        store.clone(),
        Duration::from_secs(config.engine_stop_grace_secs),
    );

    let notifier = selfray::notify::Notifier::new();
    let reconciler = selfray::reconcile::spawn_reconciler(
        store.clone(),
        Arc::new(engine.clone()),
        notifier.clone(),
        Duration::from_secs(config.reconcile_interval_secs),
    );

    // Bring the engine up on boot when there is something to serve.
    if engine.engine_installed() {
        let has_inbounds = store.lock().await.count_inbounds()? > 0;
        if has_inbounds && !engine.start().await {
            warn!("engine did not start; panel continues without it");
        }
    } else {
        warn!(
            engine_bin = %config.engine_bin.display(),
            "engine binary not installed; panel starts without a running engine"
        );
    }

    let app = selfray::http::build_router(config.clone(), store.clone(), engine.clone(), notifier)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        "starting selfray"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Teardown order: stop the policy loop first so it cannot restart the
    // engine behind our back, then stop the child process itself.
    reconciler.shutdown().await;
    engine.stop().await;
    info!("selfray stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
