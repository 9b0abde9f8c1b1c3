//! Stepflow engine entry point.
//!
//! Binary name: `stepflow`
//!
//! Parses CLI arguments, then either validates workflow definition files
//! offline or starts the engine: REST API, dispatch worker pool, callback
//! intake consumers, and the instance timeout watchdog.

mod cli;
mod http;
mod state;

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepflow=debug",
        _ => "trace",
    };
    let enable_otel = matches!(cli.command, Commands::Serve { otel: true, .. });
    stepflow_observe::tracing_setup::init_tracing(filter, enable_otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    match cli.command {
        Commands::Validate { path } => {
            cli::workflow::validate(&path)?;
        }

        Commands::Serve { port, host, .. } => {
            serve(&host, port).await?;
        }
    }

    stepflow_observe::tracing_setup::shutdown_tracing();
    Ok(())
}

/// Run the engine until Ctrl+C or SIGTERM.
async fn serve(host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState::init().await?;
    let shutdown = CancellationToken::new();

    // Intake first: it declares the queue topology the dispatcher and the
    // callback ingress publish into.
    let mut tasks = state
        .intake()
        .start(state.config.intake.consumer_count, &shutdown)
        .await?;
    tasks.extend(state.dispatcher.spawn_workers(&shutdown).await);
    tasks.push(stepflow_core::engine::watchdog::spawn_watchdog(
        state.runner.clone(),
        Duration::from_secs(state.config.engine.watchdog_interval_seconds),
        &shutdown,
    ));

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("Stepflow engine listening on http://{addr}");
    println!("Press Ctrl+C to stop");

    let broker = state.broker.clone();
    let router = http::router::build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the background tasks; in-flight messages finish first.
    shutdown.cancel();
    broker.close();
    for task in tasks {
        let _ = task.await;
    }

    println!("\nEngine stopped.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
