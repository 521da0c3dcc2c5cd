//! The top-level error taxonomy, unifying each component's own error enum
//! into one type with a single `IntoResponse` impl for the REST surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::database::DatabaseError;
use crate::docker::traits::DockerError;
use crate::executor::ExecutorError;
use crate::extensions::ExtensionError;
use crate::policy::PolicyError;
use crate::pool::PoolError;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

impl EngineError {
    fn status(&self) -> StatusCode {
        match self {
            EngineError::Pool(PoolError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Policy(PolicyError::OverrideWidensLimit(_)) | EngineError::Policy(PolicyError::UnknownTier(_)) => StatusCode::BAD_REQUEST,
            EngineError::Pool(PoolError::ReadinessTimeout) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Renders this error as an outbound wire message for a channel, rather
    /// than an HTTP response — used when a REST-shaped error surfaces
    /// inside a session's execution instead of at a `/healthz`-style route.
    pub fn to_wire_error(&self) -> crate::realtime::Outbound {
        crate::realtime::Outbound::Error { message: self.to_string() }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
