//! Realtime Gateway (C6): the duplex channel between a browser tab and the
//! engine. One [`Channel`] per connection; channels are otherwise stateless
//! from the gateway's point of view — everything durable lives in C2/C5.
//!
//! An axum `WebSocketUpgrade` handler hands off to a per-socket driver
//! function once a JWT-in-query-string auth step accepts the upgrade.

mod auth;
mod channel;
pub mod wire;

pub use auth::{validate_channel_token, ChannelClaims};
pub use channel::{ChannelError, ChannelSettings};
pub use wire::{Inbound, Outbound};

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;

use crate::docker::traits::ContainerRuntime;
use crate::pool::{ContainerPool, UserContext};
use crate::registry::SessionRegistry;

pub struct GatewayState<R: ContainerRuntime> {
    pub pool: Arc<ContainerPool<R>>,
    pub registry: Arc<SessionRegistry>,
    pub jwt_secret: Arc<str>,
    pub settings: ChannelSettings,
}

// Manual impl: `#[derive(Clone)]` would require `R: Clone`, but every field
// here is already cheap to clone regardless of what `R` is.
impl<R: ContainerRuntime> Clone for GatewayState<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            jwt_secret: self.jwt_secret.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl ChannelSettings {
    pub fn from_config(cfg: &crate::config::RealtimeConfiguration) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
            outbound_queue_bound: cfg.outbound_queue_bound,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub token: String,
}

/// The `/ws` upgrade endpoint. Token validation happens before the upgrade
/// completes so an unauthenticated caller never gets a live socket.
pub async fn ws_handler<R: ContainerRuntime + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState<R>>,
    Query(query): Query<ChannelQuery>,
) -> Response {
    let claims = match validate_channel_token(&query.token, &state.jwt_secret) {
        Ok(c) => c,
        Err(e) => {
            warn!("channel auth rejected: {}", e);
            return (StatusCode::UNAUTHORIZED, e).into_response();
        }
    };

    let user = UserContext {
        user_id: claims.user_id,
        tier: claims.tier,
        resource_override: claims.resource_override,
        api_base_url: claims.api_base_url,
        api_token: claims.api_token,
        model: claims.model,
        context_window: claims.context_window,
    };

    ws.on_upgrade(move |socket| channel::serve(socket, user, state.pool, state.registry, state.settings))
}
