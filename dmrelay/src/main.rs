mod server;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use dmrelay_core::{
    logging, Config, EventRouter, EventSink, FleetScheduler, RoomSupervisor, SessionFactory,
};
use server::{build_router, AppState, SubscriberHub};
use upstream::GatewaySessionFactory;

#[derive(Parser, Debug)]
#[command(name = "dmrelay", version, about = "Danmaku relay server")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "DMRELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration and fail fast on misconfigurations
    let config = Config::load(cli.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("dmrelay starting...");

    // 3. Wire the relay: subscriber hub (sink) <- router <- supervisor
    let hub = Arc::new(SubscriberHub::new());
    let router = Arc::new(EventRouter::new(Arc::clone(&hub) as Arc<dyn EventSink>));
    let factory = Arc::new(GatewaySessionFactory::new(
        config.upstream.gateway_url.clone(),
    ));
    let supervisor = RoomSupervisor::new(
        factory as Arc<dyn SessionFactory>,
        config.credentials(),
        router,
    );

    // 4. Optional fleet reconnect sweep
    let sweep_task = FleetScheduler::from_config(
        config.upstream.reconnect_cron.as_deref(),
        supervisor.clone(),
    )?
    .map(FleetScheduler::spawn);
    if sweep_task.is_none() {
        info!("Fleet reconnect sweep disabled");
    }

    // 5. Serve the downstream push channel
    let state = AppState {
        hub,
        supervisor: supervisor.clone(),
        basic_auth: config.server.basic_auth.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_address()).await?;
    info!("Danmaku relay listening at {}", config.listen_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Graceful teardown: stop sweeps, close every upstream session
    info!("Shutting down, closing upstream sessions");
    if let Some(task) = sweep_task {
        task.abort();
    }
    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
}
