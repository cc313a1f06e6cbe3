//! Shared test doubles: work items, processors, and a recording telemetry sink.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cache::InMemoryStore;
use crate::processor::{ProcessorRegistry, WorkItemProcessor};
use crate::scope::{ConcurrencyLimit, WorkItemScopeManager};
use crate::state::ReplicaState;
use crate::telemetry::{TelemetryRecorder, TelemetryScope};
use crate::types::{ReplicaId, WorkItem, WorkItemType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemA {
    pub value: String,
}

impl WorkItem for ItemA {
    const WORK_ITEM_TYPE: &'static str = "AWorkItem";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemB {
    pub value: String,
}

impl WorkItem for ItemB {
    const WORK_ITEM_TYPE: &'static str = "BWorkItem";
}

/// An item whose outcome is chosen by the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptedItem {
    pub outcome: Scripted,
    pub mutex_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scripted {
    Succeed,
    ReturnFalse,
    Fail,
    Panic,
}

impl WorkItem for ScriptedItem {
    const WORK_ITEM_TYPE: &'static str = "ScriptedWorkItem";
}

impl ScriptedItem {
    pub fn new(outcome: Scripted) -> Self {
        ScriptedItem {
            outcome,
            mutex_key: None,
        }
    }

    pub fn locked(outcome: Scripted, key: &str) -> Self {
        ScriptedItem {
            outcome,
            mutex_key: Some(key.to_string()),
        }
    }
}

/// Records `"<processor>:<value>"` for every item it processes.
#[derive(Debug, Clone)]
pub struct RecordingProcessor {
    pub name: &'static str,
    pub seen: Arc<Mutex<Vec<String>>>,
}

impl RecordingProcessor {
    pub fn new(name: &'static str) -> Self {
        RecordingProcessor {
            name,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn record(&self, value: &str) {
        self.seen
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, value));
    }
}

impl WorkItemProcessor<ItemA> for RecordingProcessor {
    async fn process_work_item(&self, item: ItemA, _: &CancellationToken) -> anyhow::Result<bool> {
        self.record(&item.value);
        Ok(true)
    }

    fn logging_context(&self, item: &ItemA) -> BTreeMap<String, String> {
        BTreeMap::from([("value".to_string(), item.value.clone())])
    }
}

impl WorkItemProcessor<ItemB> for RecordingProcessor {
    async fn process_work_item(&self, item: ItemB, _: &CancellationToken) -> anyhow::Result<bool> {
        self.record(&item.value);
        Ok(true)
    }
}

/// Runs [`ScriptedItem`]s, optionally holding each one until a permit is
/// released, and tracks how many run at once.
#[derive(Debug, Clone)]
pub struct ScriptedProcessor {
    pub gate: Option<Arc<Semaphore>>,
    pub running: Arc<AtomicUsize>,
    pub max_running: Arc<AtomicUsize>,
    pub completed: Arc<AtomicUsize>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        ScriptedProcessor {
            gate: None,
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Items block until a permit is added to the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let processor = ScriptedProcessor {
            gate: Some(gate.clone()),
            ..Self::new()
        };
        (processor, gate)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl WorkItemProcessor<ScriptedItem> for ScriptedProcessor {
    async fn process_work_item(
        &self,
        item: ScriptedItem,
        _: &CancellationToken,
    ) -> anyhow::Result<bool> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        } else {
            tokio::task::yield_now().await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        match item.outcome {
            Scripted::Succeed => Ok(true),
            Scripted::ReturnFalse => Ok(false),
            Scripted::Fail => anyhow::bail!("scripted failure"),
            Scripted::Panic => panic!("scripted panic"),
        }
    }

    fn mutex_key(&self, item: &ScriptedItem) -> Option<String> {
        item.mutex_key.clone()
    }
}

/// Counts completion scopes, successes, and closes.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    pub started: AtomicUsize,
    pub successes: AtomicUsize,
    pub closed: AtomicUsize,
    pub types: Mutex<Vec<WorkItemType>>,
}

impl RecordingTelemetry {
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.started.load(Ordering::SeqCst),
            self.successes.load(Ordering::SeqCst),
            self.closed.load(Ordering::SeqCst),
        )
    }
}

impl TelemetryRecorder for Arc<RecordingTelemetry> {
    fn record_completion(&self, work_item_type: &WorkItemType) -> Box<dyn TelemetryScope> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.types.lock().unwrap().push(work_item_type.clone());
        Box::new(RecordingScope {
            telemetry: self.clone(),
        })
    }
}

struct RecordingScope {
    telemetry: Arc<RecordingTelemetry>,
}

impl TelemetryScope for RecordingScope {
    fn set_success(&mut self) {
        self.telemetry.successes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for RecordingScope {
    fn drop(&mut self) {
        self.telemetry.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A replica that has finished initialization and been started.
pub async fn working_state(store: Arc<InMemoryStore>) -> Arc<ReplicaState<InMemoryStore>> {
    let state = Arc::new(ReplicaState::new(ReplicaId::new("test-replica"), store));
    state.mark_initializing_done().await.unwrap();
    state.start().await.unwrap();
    state
}

/// A gate over `state` with recording telemetry.
pub fn scope_manager(
    state: Arc<ReplicaState<InMemoryStore>>,
    registry: ProcessorRegistry,
    limit: ConcurrencyLimit,
) -> (WorkItemScopeManager<InMemoryStore>, Arc<RecordingTelemetry>) {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let manager = WorkItemScopeManager::new(state, registry, Arc::new(telemetry.clone()))
        .with_limit(limit);
    (manager, telemetry)
}
