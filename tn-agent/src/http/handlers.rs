//! Route handlers for the agent API.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use super::error::ApiError;
use crate::agent::{AgentMetrics, TnAgent};
use crate::bandwidth::BandwidthSnapshot;
use crate::vxlan::TunnelStatus;
use tn_shared::{
    API_VERSION, BandwidthPolicy, PerformanceMetrics, PerformanceTestConfig, TcStatus, TnConfig,
    TnStatus,
};

pub type AgentState = Arc<TnAgent>;
type ApiResult<T> = Result<T, ApiError>;

// ── Health and status ───────────────────────────────────────────────

pub async fn health(State(agent): State<AgentState>) -> Response {
    let healthy = agent.is_healthy();
    let body = json!({
        "healthy": healthy,
        "timestamp": chrono::Utc::now(),
        "version": API_VERSION,
        "cluster": agent.cluster_name(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

pub async fn status(State(agent): State<AgentState>) -> Json<TnStatus> {
    Json(agent.get_status().await)
}

// ── Configuration ───────────────────────────────────────────────────

pub async fn get_config(State(agent): State<AgentState>) -> Json<TnConfig> {
    Json(agent.config())
}

pub async fn update_config(
    State(agent): State<AgentState>,
    payload: Result<Json<TnConfig>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(config) = payload?;
    agent.update_config(config).await?;
    Ok(Json(json!({
        "status": "updated",
        "timestamp": chrono::Utc::now(),
    })))
}

// ── Slices ──────────────────────────────────────────────────────────

pub async fn list_slices(State(agent): State<AgentState>) -> Json<Value> {
    let slices = agent.list_slices();
    Json(json!({ "count": slices.len(), "slices": slices }))
}

pub async fn configure_slice(
    State(agent): State<AgentState>,
    Path(slice_id): Path<String>,
    payload: Result<Json<TnConfig>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(config) = payload?;
    agent.configure_slice(&slice_id, config).await?;
    Ok(Json(json!({
        "sliceId": slice_id,
        "status": "configured",
        "timestamp": chrono::Utc::now(),
    })))
}

pub async fn delete_slice(
    State(agent): State<AgentState>,
    Path(slice_id): Path<String>,
) -> ApiResult<Json<Value>> {
    agent.delete_slice(&slice_id).await?;
    Ok(Json(json!({
        "sliceId": slice_id,
        "status": "deleted",
        "timestamp": chrono::Utc::now(),
    })))
}

// ── Performance tests ───────────────────────────────────────────────

pub async fn run_test(
    State(agent): State<AgentState>,
    payload: Result<Json<PerformanceTestConfig>, JsonRejection>,
) -> ApiResult<Json<PerformanceMetrics>> {
    let Json(config) = payload?;
    Ok(Json(agent.run_performance_test(config).await?))
}

pub async fn get_test_result(
    State(agent): State<AgentState>,
    Path(test_id): Path<String>,
) -> ApiResult<Json<PerformanceMetrics>> {
    Ok(Json(agent.get_test_result(&test_id)?))
}

// ── VXLAN ───────────────────────────────────────────────────────────

pub async fn vxlan_status(State(agent): State<AgentState>) -> ApiResult<Json<TunnelStatus>> {
    Ok(Json(agent.tunnel_status().await?))
}

pub async fn update_peers(
    State(agent): State<AgentState>,
    payload: Result<Json<Vec<String>>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(peers) = payload?;
    agent.update_peers(peers.clone()).await?;
    Ok(Json(json!({
        "peers": peers,
        "status": "updated",
        "timestamp": chrono::Utc::now(),
    })))
}

pub async fn test_connectivity(State(agent): State<AgentState>) -> ApiResult<Json<Value>> {
    let connectivity = agent.test_connectivity().await?;
    Ok(Json(json!({
        "connectivity": connectivity,
        "timestamp": chrono::Utc::now(),
    })))
}

// ── Traffic control ─────────────────────────────────────────────────

pub async fn tc_status(State(agent): State<AgentState>) -> ApiResult<Json<TcStatus>> {
    Ok(Json(agent.tc_status().await?))
}

pub async fn apply_tc_rules(
    State(agent): State<AgentState>,
    payload: Result<Json<BandwidthPolicy>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(policy) = payload?;
    agent.apply_tc_rules(policy.clone()).await?;
    Ok(Json(json!({
        "status": "applied",
        "timestamp": chrono::Utc::now(),
        "policy": policy,
    })))
}

pub async fn clear_tc_rules(State(agent): State<AgentState>) -> ApiResult<Json<Value>> {
    agent.clear_tc_rules().await?;
    Ok(Json(json!({
        "status": "cleared",
        "timestamp": chrono::Utc::now(),
    })))
}

// ── Bandwidth ───────────────────────────────────────────────────────

pub async fn bandwidth(State(agent): State<AgentState>) -> ApiResult<Json<BandwidthSnapshot>> {
    Ok(Json(agent.bandwidth().await?))
}

/// Server-sent events: the current sample, then one event per monitor tick.
pub async fn bandwidth_stream(
    State(agent): State<AgentState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let updates = agent.bandwidth_updates()?;
    let initial = agent
        .bandwidth()
        .await
        .ok()
        .and_then(|snapshot| Event::default().json_data(&snapshot).ok());

    let ticks = BroadcastStream::new(updates).filter_map(|update| {
        // Lagged receivers skip ahead to the next sample
        update.ok().and_then(|snapshot| Event::default().json_data(&snapshot).ok())
    });
    let stream = tokio_stream::iter(initial).chain(ticks).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ── iperf3 servers ──────────────────────────────────────────────────

pub async fn iperf_servers(State(agent): State<AgentState>) -> Json<Value> {
    let servers = agent.iperf_servers().await;
    Json(json!({
        "count": servers.len(),
        "servers": servers,
        "timestamp": chrono::Utc::now(),
    }))
}

pub async fn start_iperf_server(
    State(agent): State<AgentState>,
    port: Result<Path<u16>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let Path(port) = port?;
    agent.start_iperf_server(port).await?;
    Ok(Json(json!({
        "port": port,
        "status": "started",
        "timestamp": chrono::Utc::now(),
    })))
}

pub async fn stop_iperf_server(
    State(agent): State<AgentState>,
    port: Result<Path<u16>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let Path(port) = port?;
    agent.stop_iperf_server(port).await?;
    Ok(Json(json!({
        "port": port,
        "status": "stopped",
        "timestamp": chrono::Utc::now(),
    })))
}

// ── Metrics ─────────────────────────────────────────────────────────

pub async fn metrics(State(agent): State<AgentState>) -> Json<AgentMetrics> {
    Json(agent.metrics().await)
}

pub async fn export_metrics(State(agent): State<AgentState>) -> ApiResult<Response> {
    let body = agent.export_metrics().await?;
    let disposition = format!(
        "attachment; filename=metrics_{}_{}.json",
        agent.cluster_name(),
        chrono::Utc::now().timestamp()
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

pub async fn prometheus(State(agent): State<AgentState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        agent.prometheus().await,
    )
        .into_response()
}

// ── Fallbacks ───────────────────────────────────────────────────────

pub async fn unknown_route(method: Method, uri: Uri) -> ApiError {
    ApiError::not_found(format!("no route for {} {}", method, uri.path()))
}

pub async fn unsupported_method(method: Method, uri: Uri) -> ApiError {
    ApiError::method_not_allowed(format!("{} is not supported on {}", method, uri.path()))
}
