//! Built-in heartbeat work item.
//!
//! The host enqueues a heartbeat to check that the queue, the scope gate and
//! dispatch are all working; the processor logs how long the item waited.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::handler::WorkItemProcessor;
use crate::types::WorkItem;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatWorkItem {
    pub sent_at: DateTime<Utc>,
}

impl HeartbeatWorkItem {
    pub fn now() -> Self {
        HeartbeatWorkItem {
            sent_at: Utc::now(),
        }
    }
}

impl WorkItem for HeartbeatWorkItem {
    const WORK_ITEM_TYPE: &'static str = "HeartbeatWorkItem";
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeartbeatProcessor;

impl WorkItemProcessor<HeartbeatWorkItem> for HeartbeatProcessor {
    async fn process_work_item(
        &self,
        item: HeartbeatWorkItem,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<bool> {
        let latency_ms = (Utc::now() - item.sent_at).num_milliseconds();
        info!(latency_ms, "Heartbeat received");
        Ok(true)
    }

    fn logging_context(&self, item: &HeartbeatWorkItem) -> BTreeMap<String, String> {
        BTreeMap::from([("sent_at".to_string(), item.sent_at.to_rfc3339())])
    }
}
