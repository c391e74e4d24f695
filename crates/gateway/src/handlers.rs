//! Control-plane HTTP handlers.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json,
        extract::{ConnectInfo, Path, Request, State, rejection::JsonRejection},
        http::HeaderMap,
        middleware::Next,
        response::Response,
    },
    qrcode::{QrCode, render::svg},
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

use crate::{
    auth::{self, IssuedToken},
    error::{ApiResponse, GatewayError, GatewayResult},
    registry::{CreateSession, SessionCounts, UpdateSession},
    session::SessionView,
    state::GatewayState,
};

type AppState = State<Arc<GatewayState>>;
type ApiResult<T> = GatewayResult<Json<ApiResponse<T>>>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> GatewayResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| GatewayError::BadRequest(e.body_text()))
}

// ── Auth ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Issue a bearer token. Blocked addresses are rejected before the login
/// delay; every other attempt is delayed and then counted by the limiter.
pub async fn login(
    State(state): AppState,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<IssuedToken> {
    let ip = auth::client_ip(&headers, peer, state.config.auth.trust_proxy);
    if let Some(retry_after) = state.limiter.retry_after(ip) {
        warn!(%ip, retry_after_secs = retry_after.as_secs(), "login rejected, address blocked");
        return Err(GatewayError::RateLimited { retry_after });
    }

    tokio::time::sleep(state.config.auth.login_delay()).await;

    let request = match body(payload) {
        Ok(request) => request,
        Err(e) => {
            state.limiter.record_attempt(ip, false);
            return Err(e);
        },
    };
    let ok = state.credentials.verify(&request.username, &request.password);
    state.limiter.record_attempt(ip, ok);
    if !ok {
        warn!(%ip, username = %request.username, "login failed");
        return Err(GatewayError::Unauthorized("invalid credentials".into()));
    }

    let token = state.signer.issue(&request.username)?;
    info!(%ip, username = %request.username, "login succeeded");
    Ok(ApiResponse::ok(token))
}

/// Bearer-token gate for the control plane.
pub async fn require_bearer(
    State(state): AppState,
    mut request: Request,
    next: Next,
) -> GatewayResult<Response> {
    let token = auth::bearer_token(request.headers())
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer token".into()))?;
    let claims = state.signer.verify(token)?;
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

// ── Health ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: String,
    pub hostname: String,
    pub uptime_secs: u64,
    pub sessions: SessionCounts,
}

pub async fn health(State(state): AppState) -> Json<ApiResponse<Health>> {
    ApiResponse::ok(Health {
        status: "ok",
        version: state.version.clone(),
        hostname: state.hostname.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        sessions: state.registry.counts(),
    })
}

// ── Sessions ─────────────────────────────────────────────────────────────────

pub async fn list_sessions(State(state): AppState) -> Json<ApiResponse<Vec<SessionView>>> {
    ApiResponse::ok(state.registry.list())
}

pub async fn create_session(
    State(state): AppState,
    payload: Result<Json<CreateSession>, JsonRejection>,
) -> ApiResult<SessionView> {
    let request = body(payload)?;
    Ok(ApiResponse::ok(state.registry.create(request).await?))
}

pub async fn get_session(State(state): AppState, Path(id): Path<String>) -> ApiResult<SessionView> {
    Ok(ApiResponse::ok(state.registry.get(&id)?))
}

pub async fn update_session(
    State(state): AppState,
    Path(id): Path<String>,
    payload: Result<Json<UpdateSession>, JsonRejection>,
) -> ApiResult<SessionView> {
    let update = body(payload)?;
    Ok(ApiResponse::ok(state.registry.update(&id, update).await?))
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub id: String,
    pub deleted: bool,
}

pub async fn delete_session(State(state): AppState, Path(id): Path<String>) -> ApiResult<Deleted> {
    state.registry.delete(&id).await?;
    Ok(ApiResponse::ok(Deleted { id, deleted: true }))
}

pub async fn connect_session(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    Ok(ApiResponse::ok(state.registry.connect(&id).await?))
}

pub async fn disconnect_session(
    State(state): AppState,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    Ok(ApiResponse::ok(state.registry.disconnect(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct WebhookUpdate {
    pub webhook_url: String,
}

pub async fn set_webhook(
    State(state): AppState,
    Path(id): Path<String>,
    payload: Result<Json<WebhookUpdate>, JsonRejection>,
) -> ApiResult<SessionView> {
    let WebhookUpdate { webhook_url } = body(payload)?;
    let update = UpdateSession {
        webhook_url: Some(webhook_url),
        ..UpdateSession::default()
    };
    Ok(ApiResponse::ok(state.registry.update(&id, update).await?))
}

#[derive(Debug, Deserialize)]
pub struct NameUpdate {
    pub name: String,
}

pub async fn set_name(
    State(state): AppState,
    Path(id): Path<String>,
    payload: Result<Json<NameUpdate>, JsonRejection>,
) -> ApiResult<SessionView> {
    let NameUpdate { name } = body(payload)?;
    let update = UpdateSession {
        name: Some(name),
        ..UpdateSession::default()
    };
    Ok(ApiResponse::ok(state.registry.update(&id, update).await?))
}

#[derive(Debug, Serialize)]
pub struct QrResponse {
    pub qr: String,
    pub svg: String,
}

pub async fn session_qr(State(state): AppState, Path(id): Path<String>) -> ApiResult<QrResponse> {
    let code = state
        .registry
        .latest_qr(&id)?
        .ok_or_else(|| GatewayError::Unavailable(format!("no pairing code issued for session {id}")))?;
    let svg = QrCode::new(code.as_bytes())
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("render qr code: {e}")))?
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .build();
    Ok(ApiResponse::ok(QrResponse { qr: code, svg }))
}
