//! SchemaFlow Evolve daemon
//!
//! Connects to the database named by DATABASE_URL, watches it for schema
//! changes and runs the evolution engine until Ctrl+C or SIGTERM.

use schemaflow_evolve::config::Settings;
use schemaflow_evolve::evolution::EvolutionEngine;
use schemaflow_evolve::introspection::PostgresInspector;
use schemaflow_evolve::snapshot::SchemaMonitor;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting SchemaFlow Evolve...");

    let settings = Settings::load()?;
    settings.validate()?;
    info!("📋 Configuration loaded successfully");

    let inspector = match PostgresInspector::connect(&settings.database).await {
        Ok(inspector) => {
            info!(
                host = %settings.database.host,
                database = %settings.database.database,
                "✅ Connected to database"
            );
            inspector
        }
        Err(e) => {
            error!("❌ FATAL: Failed to connect to database: {}", e);
            return Err(e.into());
        }
    };

    let monitor = SchemaMonitor::open(Arc::new(inspector), settings.monitor.clone()).await?;
    let engine = EvolutionEngine::builder(monitor, settings.evolution.clone())
        .notifications(settings.notifications.clone())
        .build()
        .await?;

    engine.start_engine().await?;
    info!(
        interval_secs = settings.monitor.check_interval_secs,
        state_dir = %settings.monitor.state_dir.display(),
        output_dir = %settings.evolution.output_dir.display(),
        "👀 Watching schema"
    );

    shutdown_signal().await;

    engine.stop_engine().await?;
    info!("👋 Shutdown complete");
    Ok(())
}

/// Initialize tracing; LOG_FORMAT=json switches to JSON lines
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_evolve=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
