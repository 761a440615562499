//! Agent HTTP API.
//!
//! Every error is returned as `{"error": "..."}`. Input and conflict errors
//! map to 4xx, subsystems that are not running to 503, and everything else
//! to 500. CORS is open to any origin.

mod error;
pub mod handlers;

pub use error::ApiError;

use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::agent::TnAgent;
use handlers::*;

/// Build the agent router.
pub fn router(agent: Arc<TnAgent>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/config", get(get_config).put(update_config))
        .route("/slices", get(list_slices))
        .route("/slices/{slice_id}", post(configure_slice).delete(delete_slice))
        .route("/tests", post(run_test))
        .route("/tests/{test_id}", get(get_test_result))
        .route("/vxlan/status", get(vxlan_status))
        .route("/vxlan/peers", put(update_peers))
        .route("/vxlan/connectivity", post(test_connectivity))
        .route("/tc/status", get(tc_status))
        .route("/tc/rules", post(apply_tc_rules).delete(clear_tc_rules))
        .route("/bandwidth", get(bandwidth))
        .route("/bandwidth/stream", get(bandwidth_stream))
        .route("/iperf/servers", get(iperf_servers))
        .route(
            "/iperf/servers/{port}",
            post(start_iperf_server).delete(stop_iperf_server),
        )
        .route("/metrics", get(metrics))
        .route("/metrics/export", get(export_metrics))
        .route("/prometheus", get(prometheus))
        .fallback(unknown_route)
        .method_not_allowed_fallback(unsupported_method)
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(agent)
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    if path == "/health" {
        debug!("{} {} {} {:?}", method, path, status.as_u16(), started.elapsed());
    } else {
        info!("{} {} {} {:?}", method, path, status.as_u16(), started.elapsed());
    }
    response
}

/// Serve the API on `listener` until `shutdown` fires.
pub async fn serve_listener(
    listener: TcpListener,
    agent: Arc<TnAgent>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("TN agent API listening on http://{}", addr);
    axum::serve(listener, router(agent))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("TN agent API stopped");
    Ok(())
}

/// Bind `addr` and serve the API until `shutdown` fires.
pub async fn serve(addr: SocketAddr, agent: Arc<TnAgent>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, agent, shutdown).await
}
