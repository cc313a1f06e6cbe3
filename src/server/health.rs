//! Liveness probe.
//!
//! Returns 200 while the replica's processor state is alive, including while
//! stopped or draining; a stopped replica is still healthy. Once the state
//! has been disposed the process is shutting down and the probe returns 503.

use axum::extract::State;
use axum::http::StatusCode;

use super::AppState;
use crate::cache::KeyValueStore;
use crate::worker::WorkQueue;

/// Health check handler.
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: text/plain
///
/// OK
/// ```
pub async fn health_handler<S: KeyValueStore, Q: WorkQueue>(
    State(app_state): State<AppState<S, Q>>,
) -> (StatusCode, &'static str) {
    if app_state.state().is_disposed() {
        (StatusCode::SERVICE_UNAVAILABLE, "DISPOSED")
    } else {
        (StatusCode::OK, "OK")
    }
}
