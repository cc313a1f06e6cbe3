//! Processor state endpoints.
//!
//! Deployment tooling can drive a replica directly over HTTP as an
//! alternative to writing its record in the shared cache.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::AppState;
use crate::cache::KeyValueStore;
use crate::state::{ProcessorState, StateError, TransitionError};
use crate::types::ReplicaId;
use crate::worker::WorkQueue;

/// Errors from the status endpoints.
#[derive(Debug, Error)]
pub enum StatusError {
    /// The command is not valid in the current state.
    #[error("{0}")]
    Conflict(#[from] TransitionError),

    /// The transition was applied but could not be persisted.
    #[error("{0}")]
    Persist(StateError),
}

impl From<StateError> for StatusError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Transition(e) => StatusError::Conflict(e),
            other => StatusError::Persist(other),
        }
    }
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let status = match &self {
            StatusError::Conflict(_) => StatusCode::CONFLICT,
            StatusError::Persist(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

/// The replica's current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub replica: ReplicaId,
    pub state: ProcessorState,
    pub open_scopes: usize,
}

fn current_status<S: KeyValueStore, Q: WorkQueue>(app_state: &AppState<S, Q>) -> StatusResponse {
    let state = app_state.state();
    StatusResponse {
        replica: state.replica().clone(),
        state: state.state(),
        open_scopes: state.open_scopes(),
    }
}

/// `GET /api/v1/status`
pub async fn status_handler<S: KeyValueStore, Q: WorkQueue>(
    State(app_state): State<AppState<S, Q>>,
) -> Json<StatusResponse> {
    Json(current_status(&app_state))
}

/// `PUT /api/v1/status/start`
pub async fn start_handler<S: KeyValueStore, Q: WorkQueue>(
    State(app_state): State<AppState<S, Q>>,
) -> Result<Json<StatusResponse>, StatusError> {
    info!("Start requested over HTTP");
    app_state.state().start().await?;
    Ok(Json(current_status(&app_state)))
}

/// `PUT /api/v1/status/stop`
///
/// Returns as soon as the drain is requested; poll `GET /api/v1/status` for
/// `Stopped`.
pub async fn stop_handler<S: KeyValueStore, Q: WorkQueue>(
    State(app_state): State<AppState<S, Q>>,
) -> Result<Json<StatusResponse>, StatusError> {
    info!("Drain requested over HTTP");
    app_state.state().request_stop_and_drain().await?;
    Ok(Json(current_status(&app_state)))
}
