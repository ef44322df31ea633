//! Admin HTTP API: identity management and relay diagnostics.

use std::net::SocketAddr;

use {
    axum::{
        Json, Router,
        extract::{ConnectInfo, Path, Request, State, rejection::JsonRejection},
        http::{StatusCode, header::AUTHORIZATION},
        middleware::Next,
        response::{IntoResponse, Response},
        routing::get,
    },
    botlink_bots::BotIdentity,
    botlink_protocol::error_codes,
    secrecy::ExposeSecret,
    serde::{Deserialize, Serialize},
    serde_json::json,
    tracing::warn,
};

use crate::{
    auth::{self, AuthMode},
    connections::ConnectionInfo,
    error::ApiError,
    relay::RequestRecord,
    server::AppState,
};

/// Paths owned by built-in routes; the chat prefix must not shadow them.
pub const RESERVED_PATHS: &[&str] = &[
    "/health",
    "/metrics",
    "/api/bots",
    "/api/connections",
    "/api/requests",
];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/bots", get(list_bots).post(register_bot))
        .route(
            "/api/bots/{name}",
            get(get_bot).patch(describe_bot).delete(delete_bot),
        )
        .route("/api/connections", get(list_connections))
        .route("/api/requests", get(list_requests))
}

/// Gate admin routes on the bearer token, or on loopback when none is set.
pub async fn require_admin(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let result = {
        let token = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(auth::bearer_token);
        auth::authorize_admin(&state.auth, token, addr.ip())
    };
    if !result.ok {
        let reason = result.reason.unwrap_or_default();
        warn!(remote = %addr, %reason, path = %req.uri().path(), "admin request rejected");
        return Err(match state.auth.mode {
            AuthMode::Token => ApiError::new(
                StatusCode::UNAUTHORIZED,
                error_codes::UNAUTHORIZED,
                "missing or invalid admin token",
            ),
            AuthMode::LoopbackOnly => ApiError::new(
                StatusCode::FORBIDDEN,
                error_codes::FORBIDDEN,
                "admin api is only available from loopback",
            ),
        });
    }
    Ok(next.run(req).await)
}

// ── Bots ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BotView {
    #[serde(flatten)]
    identity: BotIdentity,
    connected: bool,
}

fn view(state: &AppState, identity: BotIdentity) -> BotView {
    let connected = state.relay.registry().lookup(&identity.name).is_ok();
    BotView {
        identity,
        connected,
    }
}

async fn list_bots(State(state): State<AppState>) -> Result<Json<Vec<BotView>>, ApiError> {
    let bots = state.relay.bots().list().await?;
    Ok(Json(bots.into_iter().map(|b| view(&state, b)).collect()))
}

async fn get_bot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<BotView>, ApiError> {
    let identity = state.relay.bots().find(&name).await?;
    Ok(Json(view(&state, identity)))
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    name: String,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn register_bot(
    State(state): State<AppState>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let identity = state
        .relay
        .bots()
        .register(&body.name, body.secret, body.description)
        .await?;
    // The only response that ever carries the secret.
    let created = json!({
        "name": identity.name,
        "secret": identity.secret.expose_secret(),
        "description": identity.description,
        "createdAt": identity.created_at,
    });
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

#[derive(Debug, Deserialize)]
struct DescribeBody {
    description: Option<String>,
}

async fn describe_bot(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<DescribeBody>, JsonRejection>,
) -> Result<Json<BotView>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let identity = state.relay.bots().describe(&name, body.description).await?;
    Ok(Json(view(&state, identity)))
}

async fn delete_bot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.relay.deregister_bot(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Diagnostics ──────────────────────────────────────────────────────────────

async fn list_connections(State(state): State<AppState>) -> Json<Vec<ConnectionInfo>> {
    Json(state.relay.registry().list())
}

async fn list_requests(State(state): State<AppState>) -> Json<Vec<RequestRecord>> {
    Json(state.relay.recent_requests())
}
