//! Completion telemetry for work items.
//!
//! A scope calls [`TelemetryRecorder::record_completion`] before invoking the
//! handler and drops the returned [`TelemetryScope`] when the handler
//! returns. [`TelemetryScope::set_success`] is called only when the handler
//! returned `true`; a handler returning `false` or failing leaves the scope
//! unsuccessful. Dropping the scope ends the measurement.

use std::fmt;
use std::time::Instant;

use tracing::{info, warn};

use crate::types::WorkItemType;

/// Starts a completion measurement for a work item.
pub trait TelemetryRecorder: Send + Sync + 'static {
    fn record_completion(&self, work_item_type: &WorkItemType) -> Box<dyn TelemetryScope>;
}

/// One in-progress measurement. Ended when dropped.
pub trait TelemetryScope: Send {
    fn set_success(&mut self);
}

/// Reports completions as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetryRecorder for TracingTelemetry {
    fn record_completion(&self, work_item_type: &WorkItemType) -> Box<dyn TelemetryScope> {
        Box::new(TracingCompletion {
            work_item_type: work_item_type.clone(),
            started: Instant::now(),
            success: false,
        })
    }
}

struct TracingCompletion {
    work_item_type: WorkItemType,
    started: Instant,
    success: bool,
}

impl fmt::Debug for TracingCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingCompletion")
            .field("work_item_type", &self.work_item_type)
            .field("success", &self.success)
            .finish_non_exhaustive()
    }
}

impl TelemetryScope for TracingCompletion {
    fn set_success(&mut self) {
        self.success = true;
    }
}

impl Drop for TracingCompletion {
    fn drop(&mut self) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        if self.success {
            info!(work_item_type = %self.work_item_type, duration_ms, success = true, "Work item completed");
        } else {
            warn!(work_item_type = %self.work_item_type, duration_ms, success = false, "Work item completed unsuccessfully");
        }
    }
}
