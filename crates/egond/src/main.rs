use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use egond::Config;
use egond::Engine;

/// Bridge between the egond event bus and ABB Ego-n controllers
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "egond.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(config.logging.env_filter())
        .init();

    tracing::info!("egond starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let engine = Arc::new(Engine::new());
    engine.register_integrations_from_config(&config);

    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                tracing::error!("Engine failed: {}", e);
            }
        })
    };

    let api = config.api.as_ref().map(|api| {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let listen = api.listen.clone();
        let port = api.port;
        let engine = engine.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = egond::api::serve(listen, port, engine, shutdown_rx).await {
                tracing::error!("HTTP API server failed: {}", e);
            }
        });
        (shutdown_tx, handle)
    });

    tracing::info!("Press Ctrl+C to exit, send SIGHUP to reload {}", args.config.display());

    let mut reload = reload_signal()?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => tracing::info!("Received shutdown signal"),
                    Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
            _ = reload.recv() => match Config::from_file(&args.config) {
                // Logging and API settings only take effect on restart
                Ok(config) => {
                    tracing::info!("Reloaded config from: {}", args.config.display());
                    engine.reconfigure(config);
                }
                Err(e) => tracing::error!("Keeping current config: {}", e),
            },
        }
    }

    if let Some((shutdown_tx, handle)) = api {
        let _ = shutdown_tx.send(());
        if let Err(e) = handle.await {
            tracing::warn!("HTTP API task failed: {}", e);
        }
    }

    tracing::info!("Stopping integrations...");
    engine.shutdown().await;
    engine_task.abort();

    tracing::info!("egond shutdown complete");
    Ok(())
}

#[cfg(unix)]
fn reload_signal() -> std::io::Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
}

/// Never fires; config reload is only wired to SIGHUP
#[cfg(not(unix))]
fn reload_signal() -> std::io::Result<NoReload> {
    Ok(NoReload)
}

#[cfg(not(unix))]
struct NoReload;

#[cfg(not(unix))]
impl NoReload {
    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}
