use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        middleware,
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    tokio::{net::TcpListener, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

#[cfg(feature = "prometheus")]
use botlink_metrics::PrometheusHandle;

use {
    botlink_bots::BotRepository,
    botlink_config::{BotlinkConfig, ServerConfig},
    botlink_protocol::{MAX_PAYLOAD_BYTES, PROTOCOL_VERSION},
};

use crate::{
    admin,
    auth::{self, ResolvedAuth},
    chat,
    relay::{RelayService, RelaySettings},
    ws::handle_worker_socket,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    pub auth: Arc<ResolvedAuth>,
    pub handshake_timeout: Duration,
    pub version: &'static str,
    pub hostname: String,
    #[cfg(feature = "prometheus")]
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(relay: Arc<RelayService>, config: &BotlinkConfig) -> Self {
        Self {
            relay,
            auth: Arc::new(auth::resolve_auth(config.server.admin_token.clone())),
            handshake_timeout: config.relay.handshake_timeout(),
            version: env!("CARGO_PKG_VERSION"),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".into()),
            #[cfg(feature = "prometheus")]
            prometheus: None,
        }
    }

    #[cfg(feature = "prometheus")]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

fn normalize_path(name: &str, path: &str) -> anyhow::Result<String> {
    let trimmed = path.trim_end_matches('/');
    if !trimmed.starts_with('/') {
        anyhow::bail!("server.{name} must start with '/', got '{path}'");
    }
    if trimmed.contains(['{', '}', '*']) {
        anyhow::bail!("server.{name} must not contain route parameters, got '{path}'");
    }
    Ok(trimmed.to_string())
}

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: AppState, server: &ServerConfig) -> anyhow::Result<Router> {
    let chat_path = normalize_path("chat_path", &server.chat_path)?;
    let worker_path = normalize_path("worker_path", &server.worker_path)?;
    if chat_path == worker_path {
        anyhow::bail!("server.chat_path and server.worker_path must differ");
    }
    if admin::RESERVED_PATHS
        .iter()
        .any(|reserved| chat_path.starts_with(reserved))
    {
        anyhow::bail!("server.chat_path '{chat_path}' collides with a built-in route");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let admin_routes = admin::routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        admin::require_admin,
    ));

    let router = Router::new()
        .route("/health", get(health_handler))
        .route(&worker_path, get(ws_upgrade_handler))
        .route(&format!("{chat_path}/{{bot}}"), post(chat::chat_handler))
        .merge(admin_routes);

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(metrics_handler));

    Ok(router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state))
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

/// Run [`RelayService::maintain`] every `every` until `shutdown` fires.
pub fn spawn_maintenance(
    relay: Arc<RelayService>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    relay.maintain().await;
                },
            }
        }
    })
}

/// Start the gateway HTTP + WebSocket server and run until ctrl-c.
pub async fn start_gateway(config: BotlinkConfig) -> anyhow::Result<()> {
    let store = botlink_store::open_store(&config.storage)
        .await
        .context("failed to open record store")?;
    let bots = Arc::new(BotRepository::new(store));
    let relay = Arc::new(RelayService::new(
        Arc::clone(&bots),
        RelaySettings::from(&config.relay),
    ));

    let state = AppState::new(Arc::clone(&relay), &config);
    #[cfg(feature = "prometheus")]
    let state = match botlink_metrics::init_prometheus() {
        Ok(handle) => state.with_prometheus(handle),
        Err(e) => {
            warn!(error = %e, "prometheus exporter unavailable");
            state
        },
    };
    let auth_mode = state.auth.mode;
    let app = build_gateway_app(state, &config.server)?;

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // Startup banner.
    let lines = [
        format!("botlink gateway v{}", env!("CARGO_PKG_VERSION")),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!(
            "chat: {}/{{bot}}  workers: {}",
            config.server.chat_path.trim_end_matches('/'),
            config.server.worker_path
        ),
        format!(
            "{} bots registered ({} store)",
            bots.list().await.map(|b| b.len()).unwrap_or(0),
            bots.backend()
        ),
        format!("admin api: {auth_mode:?}"),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let shutdown = CancellationToken::new();
    let maintenance = spawn_maintenance(
        Arc::clone(&relay),
        config.relay.sweep_interval(),
        shutdown.clone(),
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        signal.cancel();
    });

    // Graceful shutdown waits on open worker sockets.
    let closer = {
        let relay = Arc::clone(&relay);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            relay.shutdown().await;
        })
    };

    serve(listener, app, shutdown.clone()).await?;
    shutdown.cancel();
    let _ = closer.await;
    let _ = maintenance.await;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "hostname": state.hostname,
        "protocol": PROTOCOL_VERSION,
        "store": state.relay.bots().backend(),
        "connections": state.relay.registry().len(),
        "pending": state.relay.pending_count(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let relay = Arc::clone(&state.relay);
    let handshake_timeout = state.handshake_timeout;
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(move |socket| handle_worker_socket(socket, relay, handshake_timeout, addr))
}

#[cfg(feature = "prometheus")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (
            axum::http::StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}
