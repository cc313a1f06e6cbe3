//! Work-item submission endpoint.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::AppState;
use crate::cache::KeyValueStore;
use crate::types::{WorkItemError, WorkItemType, peek_work_item_type};
use crate::worker::{QueueError, WorkQueue};

/// Errors from submitting a work item.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The body is not a work-item payload.
    #[error("{0}")]
    Malformed(#[from] WorkItemError),

    /// No processor is registered for the payload's type.
    #[error("no processor registered for work item type {0}")]
    UnknownType(WorkItemType),

    /// The queue rejected the payload.
    #[error("{0}")]
    Queue(#[from] QueueError),
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitError::Malformed(_) | SubmitError::UnknownType(_) => StatusCode::BAD_REQUEST,
            SubmitError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub work_item_type: WorkItemType,
}

/// `POST /api/v1/work-items`
///
/// Accepts a raw work-item payload and enqueues it unchanged. Only the
/// discriminator is checked here; the typed fields are decoded when the item
/// is processed.
pub async fn submit_handler<S: KeyValueStore, Q: WorkQueue>(
    State(app_state): State<AppState<S, Q>>,
    body: String,
) -> Result<(StatusCode, Json<SubmitResponse>), SubmitError> {
    let work_item_type = peek_work_item_type(&body)?;
    if !app_state.registry().contains(&work_item_type) {
        warn!(work_item_type = %work_item_type, "Rejected work item with unknown type");
        return Err(SubmitError::UnknownType(work_item_type));
    }

    app_state.queue().send(body).await?;
    debug!(work_item_type = %work_item_type, "Work item enqueued");

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { work_item_type })))
}
