//! 守护进程管理 API（供本机 CLI 调用）
//!
//! - GET    /internal/status                 - 在线客户端
//! - GET    /internal/clients                - 客户端总览
//! - POST   /internal/clients                - 创建客户端
//! - DELETE /internal/clients/{name}         - 删除客户端
//! - POST   /internal/clients/{name}/renew   - 续期（同时解除封禁）
//! - POST   /internal/clients/{name}/block   - 封禁并踢线
//! - POST   /internal/clients/{name}/unblock - 解除封禁
//! - GET    /internal/clients/bulk?action=   - 批量操作的候选列表
//! - POST   /internal/clients/bulk           - 批量操作
//! - GET    /internal/traffic                - 流量报表
//! - POST   /internal/traffic/clear          - 清空流量统计
//! - POST   /internal/remote                 - 改写所有配置中的服务器地址

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::admin::{
    AdminError, BulkAction, BulkRequest, CreateRequest, RemoteRequest, RenewRequest,
};
use super::warden::Warden;

pub const SECRET_HEADER: &str = "X-Admin-Secret";

#[derive(Clone)]
struct AdminApiState {
    secret: String,
    warden: Arc<Warden>,
}

fn verify_secret(headers: &HeaderMap, expected: &str) -> bool {
    if expected.is_empty() {
        return true;
    }
    headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s == expected)
        .unwrap_or(false)
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn unauthorized() -> ApiResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "invalid secret", "details": []})),
    )
}

fn ok_json<T: Serialize>(value: &T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(v) => (StatusCode::OK, Json(v)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string(), "details": []})),
        ),
    }
}

fn error_response(err: AdminError) -> ApiResponse {
    let status = match &err {
        AdminError::InvalidName(_)
        | AdminError::InvalidSelection(_)
        | AdminError::NothingSelected
        | AdminError::InvalidDays(_)
        | AdminError::InvalidRemote(_) => StatusCode::BAD_REQUEST,
        AdminError::UnknownClient(_) => StatusCode::NOT_FOUND,
        AdminError::AlreadyExists(_) => StatusCode::CONFLICT,
        AdminError::Internal(e) => {
            error!("管理操作失败: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(serde_json::json!({"error": err.to_string(), "details": err.details()})),
    )
}

fn respond<T: Serialize>(result: Result<T, AdminError>) -> ApiResponse {
    match result {
        Ok(v) => ok_json(&v),
        Err(e) => error_response(e),
    }
}

async fn handle_status(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    ok_json(&state.warden.status().await)
}

async fn handle_list_clients(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    ok_json(&state.warden.clients(Utc::now()).await)
}

async fn handle_create_client(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
    Json(req): Json<CreateRequest>,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    respond(
        state
            .warden
            .create(&req.name, req.days.as_deref(), Utc::now())
            .await,
    )
}

async fn handle_remove_client(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    respond(state.warden.remove(&name).await)
}

async fn handle_renew_client(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(req): Json<RenewRequest>,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    let result = state
        .warden
        .renew(&name, req.days.as_deref(), Utc::now())
        .await
        .map(|expire| serde_json::json!({"name": name, "expire": expire}));
    respond(result)
}

async fn handle_block_client(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    let result = state
        .warden
        .block(&name)
        .await
        .map(|terminated| serde_json::json!({"name": name, "terminated": terminated}));
    respond(result)
}

async fn handle_unblock_client(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    let result = state
        .warden
        .unblock(&name)
        .await
        .map(|()| serde_json::json!({"name": name, "status": "ok"}));
    respond(result)
}

#[derive(Deserialize)]
struct CandidatesQuery {
    action: BulkAction,
}

async fn handle_bulk_candidates(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
    Query(query): Query<CandidatesQuery>,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    ok_json(&state.warden.bulk_candidates(query.action).await)
}

async fn handle_bulk(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
    Json(req): Json<BulkRequest>,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    respond(state.warden.bulk(req.action, &req.selection).await)
}

async fn handle_traffic(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    ok_json(&state.warden.traffic_report().await)
}

async fn handle_clear_traffic(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    let result = state
        .warden
        .clear_traffic()
        .await
        .map(|backup| serde_json::json!({"status": "ok", "backup": backup}));
    respond(result)
}

async fn handle_update_remote(
    Extension(state): Extension<AdminApiState>,
    headers: HeaderMap,
    Json(req): Json<RemoteRequest>,
) -> impl IntoResponse {
    if !verify_secret(&headers, &state.secret) {
        return unauthorized();
    }
    respond(state.warden.update_remote(&req.host, req.port).await)
}

fn router(warden: Arc<Warden>, secret: String) -> Router {
    let state = AdminApiState { secret, warden };

    Router::new()
        .route("/internal/status", get(handle_status))
        .route("/internal/clients", get(handle_list_clients).post(handle_create_client))
        .route("/internal/clients/bulk", get(handle_bulk_candidates).post(handle_bulk))
        .route("/internal/clients/{name}", delete(handle_remove_client))
        .route("/internal/clients/{name}/renew", post(handle_renew_client))
        .route("/internal/clients/{name}/block", post(handle_block_client))
        .route("/internal/clients/{name}/unblock", post(handle_unblock_client))
        .route("/internal/traffic", get(handle_traffic))
        .route("/internal/traffic/clear", post(handle_clear_traffic))
        .route("/internal/remote", post(handle_update_remote))
        .layer(Extension(state))
}

/// 启动管理 API，取消令牌触发后优雅退出
pub async fn start_admin_api(
    bind: &str,
    secret: String,
    warden: Arc<Warden>,
    token: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("管理 API 无法监听 {}", bind))?;
    info!("🛠️ 管理 API 启动: {}", bind);

    serve(listener, secret, warden, token).await
}

async fn serve(
    listener: tokio::net::TcpListener,
    secret: String,
    warden: Arc<Warden>,
    token: CancellationToken,
) -> Result<()> {
    let app = router(warden, secret);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("管理 API 异常退出")?;
    Ok(())
}
