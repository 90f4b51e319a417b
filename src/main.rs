use jobsmith::config::JobsmithConfig;
use jobsmith::core::{HandlerRegistry, Jobsmith};
use jobsmith::{logging, server};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let config = match JobsmithConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.logging);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Worker exited with error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: JobsmithConfig) -> jobsmith::WorkerResult<()> {
    let jobsmith = Arc::new(Jobsmith::connect(config, HandlerRegistry::standard()).await?);
    jobsmith.start().await?;

    let served = server::serve(Arc::clone(&jobsmith), shutdown_signal()).await;
    if let Err(e) = &served {
        error!("HTTP endpoint failed: {}", e);
    }

    info!("Shutting down, waiting for in-flight jobs");
    jobsmith.stop().await?;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
