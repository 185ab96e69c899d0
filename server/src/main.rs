use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use schemaforge::{load_config, CommandGenerator, Config, Runtime, SchemaforgeError};
use schemaforge_server::telemetry;
use schemaforge_server::{build_app_router, AppState, ServerConfig};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Pipeline(#[from] SchemaforgeError),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    if let Err(e) = telemetry::init_tracing() {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let server_config = ServerConfig::from_env().map_err(SchemaforgeError::from)?;
    let config = pipeline_config()?;
    info!(host = %server_config.host, port = server_config.port, "Loaded server configuration");

    let generator = Arc::new(CommandGenerator::new(
        config.generator.program.clone(),
        config.generator.args.clone(),
    ));
    let runtime = Runtime::start(config, generator)?;

    let app = build_app_router(AppState::from_runtime(&runtime), &server_config);
    let listener = tokio::net::TcpListener::bind(server_config.bind_address()).await?;
    info!(addr = %listener.local_addr()?, "Starting server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Server stopped accepting connections, draining workers");
    runtime.shutdown().await?;
    served?;
    Ok(())
}

/// Reads `SCHEMAFORGE_CONFIG` (JSON or YAML) when set, then applies
/// environment overrides.
fn pipeline_config() -> Result<Config, SchemaforgeError> {
    let mut config = match std::env::var("SCHEMAFORGE_CONFIG") {
        Ok(path) if !path.trim().is_empty() => {
            info!(path = %path, "Loading configuration file");
            load_config(path.trim())?
        }
        _ => Config::default(),
    };
    config.apply_env()?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
