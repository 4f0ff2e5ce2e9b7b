//! Management HTTP API (C9)
//!
//! A small `axum` router exposing the process's read/control surface over
//! HTTP: app details, bulk and per-backend circuit rotation, per-backend
//! health/stats/exit-IP/config/metrics, and the two `SETCONF`-backed
//! mutations (port change, node policy change). Grounded in the pack's
//! `rexbrahh-plfm-vt` and `vvylym-lemonade-tokio` axum services for the
//! typed-state-plus-typed-response shape; logs through `log`, same as the
//! rest of this process, rather than pulling in `tracing` for one module.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::backend::{NodePolicyKind, PortKind};
use crate::circuit::CircuitManager;
use crate::net_util::parse_exit_ip_body;
use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn internal_error(message: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

/// Shared handler state: the app state plus the circuit manager, which
/// `supervisor.rs` owns but this router needs for the rotate routes.
#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<AppState>,
    pub circuit: Arc<CircuitManager>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/app", get(get_app))
        .route("/rotate", post(post_rotate))
        .route("/backends/:id/health", get(get_backend_health))
        .route("/backends/:id/stats", get(get_backend_stats))
        .route("/backends/:id/rotate", post(post_backend_rotate))
        .route(
            "/backends/:id/exit-ip",
            get(get_backend_exit_ip).post(post_backend_exit_ip),
        )
        .route("/backends/:id/config", get(get_backend_config))
        .route("/backends/:id/config/port", post(post_backend_port))
        .route("/backends/:id/config/policy", post(post_backend_policy))
        .route("/backends/:id/metrics", get(get_backend_metrics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct AppDetails {
    pub socks_bind: String,
    pub socks_port: u16,
    pub dns_bind: String,
    pub dns_port: u16,
    pub api_bind: String,
    pub api_port: u16,
    pub method: String,
    pub backend_count: usize,
    pub healthy_backend_count: usize,
    pub protection_mode_enabled: bool,
}

async fn get_app(State(state): State<ApiState>) -> Json<AppDetails> {
    let config = state.app.config();
    let pool = state.app.backend_pool();

    Json(AppDetails {
        socks_bind: config.socks_bind.clone(),
        socks_port: config.socks_port,
        dns_bind: config.dns_bind.clone(),
        dns_port: config.dns_port,
        api_bind: config.api_bind.clone(),
        api_port: config.api_port,
        method: config.method.to_string(),
        backend_count: pool.total_count(),
        healthy_backend_count: pool.healthy_count(),
        protection_mode_enabled: state.app.protection_mode().is_enabled(),
    })
}

#[derive(Debug, Serialize)]
pub struct RotateResult {
    pub rotated: usize,
}

async fn post_rotate(State(state): State<ApiState>) -> ApiResult<RotateResult> {
    match state.circuit.bulk_rotate().await {
        Ok(rotated) => Ok(Json(RotateResult { rotated })),
        Err(e) => {
            log::warn!("bulk rotate request rejected: {}", e);
            Err((
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

fn find_backend_or_404(
    state: &ApiState,
    id: u32,
) -> Result<Arc<crate::backend::BackendState>, ApiError> {
    state
        .app
        .backend_pool()
        .find_backend(id)
        .ok_or_else(|| not_found(format!("no backend with id {}", id)))
}

#[derive(Debug, Serialize)]
pub struct BackendHealth {
    pub id: u32,
    pub healthy_cached: bool,
    pub healthy_live: bool,
    pub consecutive_failures: u32,
    pub active_connections: usize,
    pub draining: bool,
}

async fn get_backend_health(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> ApiResult<BackendHealth> {
    let backend = find_backend_or_404(&state, id)?;
    let live = backend
        .check_health(std::time::Duration::from_secs(
            crate::constants::HEALTH_CHECK_BOOTSTRAP_TIMEOUT_SECS,
        ))
        .await;

    Ok(Json(BackendHealth {
        id: backend.id,
        healthy_cached: backend.is_healthy(),
        healthy_live: live,
        consecutive_failures: backend.consecutive_failures(),
        active_connections: backend.active_connections(),
        draining: backend.is_draining(),
    }))
}

#[derive(Debug, Serialize)]
pub struct BackendStats {
    pub id: u32,
    pub version: Option<String>,
    pub traffic_read: Option<u64>,
    pub traffic_written: Option<u64>,
}

async fn get_backend_stats(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> ApiResult<BackendStats> {
    let backend = find_backend_or_404(&state, id)?;

    let version = backend
        .send_control("GETINFO version", false)
        .await
        .ok()
        .and_then(|r| parse_getinfo_value(&r, "version"));
    let traffic_read = backend
        .send_control("GETINFO traffic/read", false)
        .await
        .ok()
        .and_then(|r| parse_getinfo_value(&r, "traffic/read"))
        .and_then(|v| v.parse().ok());
    let traffic_written = backend
        .send_control("GETINFO traffic/written", false)
        .await
        .ok()
        .and_then(|r| parse_getinfo_value(&r, "traffic/written"))
        .and_then(|v| v.parse().ok());

    Ok(Json(BackendStats {
        id: backend.id,
        version,
        traffic_read,
        traffic_written,
    }))
}

/// Pulls the value out of a `250-key=value` or `250 key=value` GETINFO
/// response line for the given key.
fn parse_getinfo_value(response: &str, key: &str) -> Option<String> {
    let prefix = format!("{}=", key);
    response.lines().find_map(|line| {
        let rest = line.strip_prefix("250-").or_else(|| line.strip_prefix("250 "))?;
        rest.strip_prefix(&prefix).map(|v| v.to_string())
    })
}

async fn post_backend_rotate(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> ApiResult<RotateResult> {
    let backend = find_backend_or_404(&state, id)?;
    match state.circuit.rotate_one(&backend).await {
        Ok(()) => Ok(Json(RotateResult { rotated: 1 })),
        Err(e) => {
            log::warn!("per-backend rotate request rejected for backend {}: {}", id, e);
            Err((
                StatusCode::CONFLICT,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExitIp {
    pub id: u32,
    pub ip: Option<String>,
    pub observed_at_ms: Option<u64>,
}

async fn get_backend_exit_ip(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> ApiResult<ExitIp> {
    let backend = find_backend_or_404(&state, id)?;
    let info = backend.get_external_ip_info();
    Ok(Json(ExitIp {
        id: backend.id,
        ip: info.as_ref().map(|i| i.ip.clone()),
        observed_at_ms: info.as_ref().map(|i| i.observed_at_ms),
    }))
}

/// Fetches the exit IP fresh through the backend's own SOCKS port, caching
/// the result on the backend. Accepts either a `{"IP":"..."}` body or a
/// plain IPv4/IPv6 text body from the configured `exit_ip_url`, per §6.
async fn post_backend_exit_ip(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> ApiResult<ExitIp> {
    let backend = find_backend_or_404(&state, id)?;
    let client = backend.get_http_client().map_err(|e| internal_error(e.to_string()))?;
    let url = state.app.config().exit_ip_url.clone();

    let body = client
        .get(&url)
        .send()
        .await
        .map_err(|e| internal_error(format!("exit-ip probe failed: {}", e)))?
        .text()
        .await
        .map_err(|e| internal_error(format!("exit-ip probe body read failed: {}", e)))?;

    let ip = parse_exit_ip_body(&body)
        .ok_or_else(|| bad_request(format!("exit-ip endpoint returned unparseable body: {}", body)))?;

    backend.set_external_ip(ip.clone());
    let info = backend.get_external_ip_info();

    Ok(Json(ExitIp {
        id: backend.id,
        ip: Some(ip),
        observed_at_ms: info.map(|i| i.observed_at_ms),
    }))
}

#[derive(Debug, Serialize)]
pub struct BackendConfigView {
    pub id: u32,
    pub host: String,
    pub control_port: u16,
    pub socks_port: u16,
    pub dns_port: u16,
    pub max_connections: Option<u32>,
}

async fn get_backend_config(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> ApiResult<BackendConfigView> {
    let backend = find_backend_or_404(&state, id)?;
    Ok(Json(BackendConfigView {
        id: backend.id,
        host: backend.config.host.clone(),
        control_port: backend.current_control_port(),
        socks_port: backend.current_socks_port(),
        dns_port: backend.current_dns_port(),
        max_connections: backend.config.max_connections,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetPortRequest {
    pub kind: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
pub struct SetPortResponse {
    pub id: u32,
    pub kind: String,
    pub port: u16,
}

async fn post_backend_port(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
    Json(request): Json<SetPortRequest>,
) -> ApiResult<SetPortResponse> {
    let backend = find_backend_or_404(&state, id)?;
    let kind = match request.kind.to_ascii_lowercase().as_str() {
        "control" => PortKind::Control,
        "socks" => PortKind::Socks,
        "dns" => PortKind::Dns,
        other => return Err(bad_request(format!("unknown port kind: {}", other))),
    };

    backend
        .set_port(kind, request.port)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(SetPortResponse {
        id: backend.id,
        kind: request.kind,
        port: request.port,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetPolicyRequest {
    pub kind: String,
    /// Empty string resets the policy (`RESETCONF`).
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct SetPolicyResponse {
    pub id: u32,
    pub kind: String,
    pub value: String,
}

async fn post_backend_policy(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
    Json(request): Json<SetPolicyRequest>,
) -> ApiResult<SetPolicyResponse> {
    let backend = find_backend_or_404(&state, id)?;
    let kind = match request.kind.to_ascii_lowercase().as_str() {
        "exitnodes" => NodePolicyKind::ExitNodes,
        "entrynodes" => NodePolicyKind::EntryNodes,
        "excludenodes" => NodePolicyKind::ExcludeNodes,
        other => return Err(bad_request(format!("unknown node policy kind: {}", other))),
    };

    backend
        .set_node_policy(kind, &request.value)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(SetPolicyResponse {
        id: backend.id,
        kind: request.kind,
        value: request.value,
    }))
}

#[derive(Debug, Serialize)]
pub struct BackendMetric {
    pub name: String,
    pub last_latency_ms: Option<u64>,
    pub last_speed_kbps: Option<f64>,
    pub consecutive_failures: u32,
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct BackendMetrics {
    pub id: u32,
    pub metrics: Vec<BackendMetric>,
}

async fn get_backend_metrics(
    State(state): State<ApiState>,
    Path(id): Path<u32>,
) -> ApiResult<BackendMetrics> {
    let backend = find_backend_or_404(&state, id)?;
    let probe_interval_secs = state.app.config().perf_config.interval_secs;

    let mut metrics: Vec<BackendMetric> = backend
        .get_perf_metrics()
        .into_iter()
        .map(|(name, metric)| BackendMetric {
            name,
            last_latency_ms: metric.last_latency_ms,
            last_speed_kbps: metric.last_speed_kbps,
            consecutive_failures: metric.consecutive_failures,
            stale: metric.is_stale(probe_interval_secs),
        })
        .collect();
    metrics.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(BackendMetrics {
        id: backend.id,
        metrics,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_getinfo_value_reads_singleline_response() {
        let response = "250-version=0.4.8.10\n250 OK\n";
        assert_eq!(
            parse_getinfo_value(response, "version"),
            Some("0.4.8.10".to_string())
        );
    }

    #[test]
    fn parse_getinfo_value_returns_none_for_missing_key() {
        let response = "250-version=0.4.8.10\n250 OK\n";
        assert_eq!(parse_getinfo_value(response, "traffic/read"), None);
    }

    #[test]
    fn parse_exit_ip_body_accepts_json_form() {
        assert_eq!(
            parse_exit_ip_body("{\"IP\":\"1.2.3.4\"}"),
            Some("1.2.3.4".to_string())
        );
    }

    #[test]
    fn parse_exit_ip_body_accepts_plain_ipv4() {
        assert_eq!(parse_exit_ip_body("203.0.113.9\n"), Some("203.0.113.9".to_string()));
    }

    #[test]
    fn parse_exit_ip_body_accepts_plain_ipv6() {
        assert_eq!(parse_exit_ip_body("2001:db8::1"), Some("2001:db8::1".to_string()));
    }

    #[test]
    fn parse_exit_ip_body_rejects_garbage() {
        assert_eq!(parse_exit_ip_body("not an ip"), None);
    }
}
