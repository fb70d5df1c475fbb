#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CliArgs, ServerConfig};
use server::refill::refill_pools;
use server::routes::router;
use server::telemetry::init_telemetry;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry()?;

    let service = server::build_service(&config)?;
    let shutdown = CancellationToken::new();

    let sweeper = config
        .refill_interval
        .map(|every| tokio::spawn(refill_pools(service.clone(), every, shutdown.clone())));

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    let serve = axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let mut serve = tokio::spawn(async move { serve.await });
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let timeout = config.shutdown_timeout;
    tokio::select! {
        res = &mut serve => res??,
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(timeout).await;
        } => {
            tracing::warn!(?timeout, "Shutdown timeout elapsed, dropping in-flight requests");
            serve.abort();
        }
    }

    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting identifier service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting identifier service on {} (max batch {})",
            config.server_addr,
            config.max_batch_size
        );
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    shutdown.cancel();
}
