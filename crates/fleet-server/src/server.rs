//! Wiring: device TCP listener plus the observer HTTP/WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use fleet_core::{DeviceRegistry, ObserverId};
use fleet_settings::{FleetSettings, ObserverSettings};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::device;
use crate::error::{Result, ServerError};
use crate::health::{self, HealthResponse};
use crate::observer::{run_observer_session, Broadcaster, PushMessage};
use crate::shutdown::ShutdownCoordinator;

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub observer: Arc<ObserverSettings>,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        observer: ObserverSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: Arc::clone(broadcaster.registry()),
            broadcaster,
            observer: Arc::new(observer),
            shutdown,
            start_time: Instant::now(),
        }
    }
}

/// Build the observer router: the WebSocket endpoint plus `/health` and
/// `/devices`.
pub fn build_router(state: AppState) -> Router {
    let ws_path = state.observer.path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/devices", get(devices_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind both listeners and start serving. Returns a handle to shut down.
pub async fn start(settings: &FleetSettings, registry: Arc<DeviceRegistry>) -> Result<ServerHandle> {
    let coordinator = ShutdownCoordinator::new();

    let device_listener = device::bind(&settings.device).await?;
    let device_addr = device_listener.local_addr()?;

    let observer_bind = format!("{}:{}", settings.observer.host, settings.observer.port);
    let observer_listener = TcpListener::bind(&observer_bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: observer_bind,
            source,
        })?;
    let observer_addr = observer_listener.local_addr()?;

    let broadcaster = Broadcaster::attach(Arc::clone(&registry));

    let _ = coordinator.spawn(device::serve(
        device_listener,
        Arc::clone(&registry),
        Arc::new(settings.device.clone()),
        coordinator.tracker(),
        coordinator.token(),
    ));

    let router = build_router(AppState::new(
        Arc::clone(&broadcaster),
        settings.observer.clone(),
        coordinator.token(),
    ));
    let token = coordinator.token();
    let _ = coordinator.spawn(async move {
        let result = axum::serve(observer_listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "observer server failed");
        }
    });

    info!(
        %device_addr,
        %observer_addr,
        ws_path = %settings.observer.path,
        "fleet server started"
    );

    Ok(ServerHandle {
        device_addr,
        observer_addr,
        registry,
        broadcaster,
        coordinator,
    })
}

/// Handle returned by [`start`]. Keeps the broadcaster attached.
pub struct ServerHandle {
    pub device_addr: SocketAddr,
    pub observer_addr: SocketAddr,
    registry: Arc<DeviceRegistry>,
    broadcaster: Arc<Broadcaster>,
    coordinator: ShutdownCoordinator,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    /// Stop accepting, close every session, and wait for them to finish.
    ///
    /// Returns `false` if `timeout` elapsed with tasks still running.
    pub async fn shutdown(self, timeout: Option<Duration>) -> bool {
        let finished = self.coordinator.graceful_shutdown(timeout).await;
        info!(
            online = self.registry.online_count(),
            finished,
            "fleet server stopped"
        );
        finished
    }
}

/// GET <ws path>: WebSocket upgrade for observers.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        run_observer_session(
            socket,
            ObserverId::new(),
            state.broadcaster,
            state.observer,
            state.shutdown,
        )
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        &state.registry,
        state.broadcaster.observer_count(),
    ))
}

/// GET /devices
async fn devices_handler(State(state): State<AppState>) -> Json<PushMessage> {
    Json(state.broadcaster.snapshot_all())
}
