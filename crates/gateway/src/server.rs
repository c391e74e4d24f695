use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use {
    axum::{
        Router,
        middleware,
        routing::{get, post, put},
    },
    sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    tower_http::{
        cors::{Any, CorsLayer},
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
    wagate_channels::{ClientFactory, DeviceStore},
    wagate_config::WagateConfig,
    wagate_sessions::SqliteSessionMetadata,
    wagate_whatsapp::{LoopbackFactory, LoopbackOptions, SledDeviceStore},
};

use crate::{handlers, state::GatewayState, ws};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_app(state: Arc<GatewayState>) -> Router {
    let protected = Router::new()
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session)
                .put(handlers::update_session)
                .delete(handlers::delete_session),
        )
        .route("/sessions/{id}/connect", post(handlers::connect_session))
        .route("/sessions/{id}/disconnect", post(handlers::disconnect_session))
        .route("/sessions/{id}/webhook", put(handlers::set_webhook))
        .route("/sessions/{id}/name", put(handlers::set_name))
        .route("/sessions/{id}/qr", get(handlers::session_qr))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            handlers::require_bearer,
        ));

    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/login", post(handlers::login))
        .route("/ws/{id}", get(ws::pairing_upgrade))
        .merge(protected)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let router = if state.config.server.cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

// ── Storage ──────────────────────────────────────────────────────────────────

fn database_path(config: &WagateConfig) -> PathBuf {
    config
        .database
        .path
        .clone()
        .unwrap_or_else(|| wagate_config::data_dir().join("wagate.db"))
}

fn devices_path(config: &WagateConfig) -> PathBuf {
    config
        .devices
        .path
        .clone()
        .unwrap_or_else(|| wagate_config::data_dir().join("devices"))
}

/// Open (creating if needed) the session metadata database.
pub async fn open_metadata(config: &WagateConfig) -> anyhow::Result<SqliteSessionMetadata> {
    let path = database_path(config);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    SqliteSessionMetadata::init(&pool).await?;
    info!(path = %path.display(), "session metadata opened");
    Ok(SqliteSessionMetadata::new(pool))
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Start the gateway HTTP + WebSocket server and run until Ctrl-C.
pub async fn start_gateway(config: WagateConfig) -> anyhow::Result<()> {
    let metadata = open_metadata(&config).await?;

    let devices_dir = devices_path(&config);
    let store: Arc<dyn DeviceStore> = Arc::new(SledDeviceStore::open(&devices_dir)?);
    let factory: Arc<dyn ClientFactory> = Arc::new(LoopbackFactory::new(
        store,
        LoopbackOptions::from(&config.devices.loopback),
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = GatewayState::new(config, factory, metadata)?;
    let restored = state.registry.restore_all().await?;
    state.spawn_background();

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let counts = state.registry.counts();
    let lines = [
        format!("wagate gateway v{}", state.version),
        format!("listening on {addr}"),
        format!(
            "{} sessions restored ({} paired)",
            restored.len(),
            counts.authenticated
        ),
        format!("devices: {}", devices_dir.display()),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let shutdown = state.shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
            },
            () = shutdown.cancelled() => {},
        }
        info!("shutting down");
    })
    .await?;

    state.shutdown.cancel();
    state.registry.shutdown().await;
    Ok(())
}
