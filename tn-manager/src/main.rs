use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

use tn_manager::TnManager;
use tn_manager::config::ConfigManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from CLI, environment and the optional manager file
    let config_manager = ConfigManager::from_cli_and_env()?;

    config_manager.validate()?;

    config_manager.init_logging()?;

    let app = config_manager.app;
    info!(
        "[MANAGER] Starting tn-manager {} with {} configured agents",
        env!("CARGO_PKG_VERSION"),
        app.agents.len()
    );

    let manager = Arc::new(TnManager::new(app.options.clone()));
    manager.start();

    // An unreachable agent is not fatal; it can be registered again later
    for entry in app.enabled_agents() {
        if let Err(e) = manager
            .register_agent_with_ip(&entry.name, &entry.endpoint, entry.cluster_ip.as_deref())
            .await
        {
            warn!("[MANAGER] Could not register agent {}: {}", entry.name, e);
        }
    }
    info!("[MANAGER] {} agents registered", manager.agent_count());

    if app.monitoring.enable_continuous {
        if let Some(dir) = &app.monitoring.export_directory {
            manager.start_continuous_export(dir.clone(), app.monitoring.export_interval);
        }
    }

    shutdown_signal().await;
    info!("[MANAGER] Received shutdown signal");

    if let Some(dir) = &app.monitoring.export_directory {
        match manager.export_metrics(dir) {
            Ok(path) => info!("[MANAGER] Final metrics written to {}", path.display()),
            Err(e) => error!("[MANAGER] Final metrics export failed: {}", e),
        }
    }

    manager.stop().await;
    info!("[MANAGER] tn-manager stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[MANAGER] Failed to listen for Ctrl+C: {}", e);
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
                error!("[MANAGER] Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
