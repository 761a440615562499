use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tn_agent::TnAgent;
use tn_agent::config::ConfigManager;
use tn_agent::http;

/// Time the HTTP server gets to drain in-flight requests on shutdown.
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from CLI and environment
    let config_manager = ConfigManager::from_cli_and_env()?;

    // Validate before touching any interface
    config_manager.validate()?;

    config_manager.init_logging()?;

    let app = config_manager.app;
    let listen_addr = app.listen_addr();
    info!(
        "[AGENT] Starting tn-agent {} for cluster {} (VNI {}, local {}, port {})",
        env!("CARGO_PKG_VERSION"),
        app.tn.cluster_name,
        app.tn.vxlan.vni,
        app.tn.vxlan.local_ip,
        app.tn.monitoring_port
    );

    let agent = Arc::new(TnAgent::new(app.tn, app.options));
    if let Err(e) = agent.start().await {
        error!("[AGENT] Failed to start: {}", e);
        return Err(e.into());
    }

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(http::serve(listen_addr, agent.clone(), shutdown.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("[AGENT] Received shutdown signal");
        }
        result = &mut server => {
            // The server only returns on its own when binding or serving failed
            match result {
                Ok(Ok(())) => warn!("[AGENT] HTTP server exited"),
                Ok(Err(e)) => error!("[AGENT] HTTP server failed: {}", e),
                Err(e) => error!("[AGENT] HTTP server task failed: {}", e),
            }
            agent.stop().await;
            return Err(anyhow::anyhow!("HTTP server on {} stopped unexpectedly", listen_addr));
        }
    }

    shutdown.cancel();
    match tokio::time::timeout(HTTP_SHUTDOWN_GRACE, &mut server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("[AGENT] HTTP server stopped with error: {}", e),
        Ok(Err(e)) => warn!("[AGENT] HTTP server task failed: {}", e),
        Err(_) => {
            warn!("[AGENT] HTTP server did not drain within {:?}", HTTP_SHUTDOWN_GRACE);
            server.abort();
        }
    }

    agent.stop().await;
    info!("[AGENT] tn-agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[AGENT] Failed to listen for Ctrl+C: {}", e);
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
                error!("[AGENT] Failed to install SIGTERM handler: {}", e);
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
