use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use creality_ws::config;
use creality_ws::fleet::Fleet;
use creality_ws::web::api::{AppStateInner, create_router};

#[derive(Debug, Parser)]
#[command(name = "creality-ws", version, about = "Creality printer WebSocket bridge")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "printer.toml")]
    config: PathBuf,

    /// Override `server.listen`
    #[arg(short, long)]
    listen: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> creality_ws::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    tracing::info!("Starting creality-ws {}", env!("CARGO_PKG_VERSION"));
    let config_path = args.config.to_string_lossy().into_owned();
    tracing::info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).inspect_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", config_path, e);
    })?;
    if config.printers.is_empty() {
        tracing::warn!("No printers configured");
    }
    for printer in &config.printers {
        tracing::info!(printer = %printer.id, host = %printer.host, model_hint = ?printer.model_hint, "printer configured");
    }

    let fleet = Fleet::start(&config);
    let state = Arc::new(AppStateInner {
        fleet: fleet.clone(),
        api_token: config.server.api_token.clone(),
    });
    let app = create_router(state);

    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    fleet.shutdown_all().await;
    Ok(())
}
