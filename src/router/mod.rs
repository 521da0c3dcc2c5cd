//! HTTP router module
//!
//! Trimmed to the engine's REST surface: a health probe, a metrics
//! snapshot, and the `/ws` upgrade into the Realtime Gateway (C6). Every
//! other teacher route (files, backups, transfers, installs) has no
//! counterpart here — session work rides the duplex channel instead.

mod handlers;

pub use handlers::system::{HealthInfo, MetricsSnapshot};

use std::sync::Arc;

use axum::{
    routing::get,
    Router,
};
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};

use crate::config::Configuration;
use crate::docker::traits::ContainerRuntime;
use crate::pool::ContainerPool;
use crate::realtime::{self, GatewayState};
use crate::registry::SessionRegistry;

/// Application state shared across handlers.
pub struct AppState<R: ContainerRuntime> {
    pub pool: Arc<ContainerPool<R>>,
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<Configuration>,
}

impl<R: ContainerRuntime> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone(), registry: self.registry.clone(), config: self.config.clone() }
    }
}

pub fn build_router<R: ContainerRuntime + 'static>(state: AppState<R>) -> Router {
    let gateway_state = GatewayState {
        pool: state.pool.clone(),
        registry: state.registry.clone(),
        jwt_secret: Arc::from(state.config.api.jwt_secret.as_str()),
        settings: realtime::ChannelSettings::from_config(&state.config.realtime),
    };

    let rest_routes = Router::new()
        .route("/healthz", get(handlers::system::healthz))
        .route("/metrics", get(handlers::system::metrics::<R>))
        .with_state(state);

    let realtime_routes = Router::new()
        .route("/ws", get(realtime::ws_handler::<R>))
        .with_state(gateway_state);

    rest_routes
        .merge(realtime_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
