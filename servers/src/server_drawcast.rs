use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod drawcast_logic;
use drawcast_logic::{config, downstream, logger, state, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let _log_guard = logger::setup_logging(
        &config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs")),
        config.log_level.as_deref().unwrap_or("info"),
        config.log_json.unwrap_or(true),
        config.log_keep.unwrap_or(7),
    )?;

    let shutdown = CancellationToken::new();
    let pipeline = upstream::start(&config, shutdown.clone()).await?;

    let app_state = state::AppState::new(
        pipeline.fanout.clone(),
        pipeline.scheduler.clone(),
        config.broker_mode(),
        Duration::from_secs(config.ping_interval_seconds.unwrap_or(20).max(1)),
        Duration::from_secs(config.liveness_timeout_seconds.unwrap_or(60)),
    );
    let mut downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state,
        shutdown.clone(),
    ));

    // Wait for shutdown signal, or a listener that never came up
    let early_exit = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
            None
        }
        _ = terminate() => {
            tracing::info!("SIGTERM received, initiating shutdown.");
            None
        }
        result = &mut downstream_handle => Some(result),
    };

    shutdown.cancel();
    if let Some(scheduler) = &pipeline.scheduler {
        scheduler.shutdown().await;
    }
    for task in pipeline.tasks {
        let _ = task.await;
    }

    let served = match early_exit {
        Some(result) => result,
        None => downstream_handle.await,
    };
    served??;

    tracing::info!("Shutdown complete.");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
