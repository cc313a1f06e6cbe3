//! Consumer loop tests against the in-memory queue.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::cache::InMemoryStore;
use crate::processor::ProcessorRegistry;
use crate::scope::ConcurrencyLimit;
use crate::state::ProcessorState;
use crate::test_utils::*;
use crate::types::encode_work_item;

const WAIT: Duration = Duration::from_millis(100);

async fn consumer_for(
    processor: ScriptedProcessor,
    queue: Arc<InMemoryQueue>,
) -> (
    WorkItemConsumer<InMemoryStore, InMemoryQueue>,
    Arc<RecordingTelemetry>,
) {
    let registry = ProcessorRegistry::builder()
        .register::<ScriptedItem, _>(Arc::new(processor))
        .build()
        .unwrap();
    let state = working_state(Arc::new(InMemoryStore::new())).await;
    let (manager, telemetry) = scope_manager(state, registry, ConcurrencyLimit::Unbounded);
    let consumer = WorkItemConsumer::new(0, manager, queue, WAIT).with_retry_delay(Duration::ZERO);
    (consumer, telemetry)
}

async fn enqueue(queue: &InMemoryQueue, outcome: Scripted) {
    queue
        .send(encode_work_item(&ScriptedItem::new(outcome)).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn processed_message_is_completed() {
    let queue = Arc::new(InMemoryQueue::new());
    let (consumer, telemetry) = consumer_for(ScriptedProcessor::new(), queue.clone()).await;
    enqueue(&queue, Scripted::Succeed).await;

    let shutdown = CancellationToken::new();
    let scope = consumer
        .manager()
        .begin_scope_when_ready(&shutdown)
        .await
        .unwrap();
    let disposition = consumer.run_in_scope(&scope, &shutdown).await;
    scope.close().await;

    assert_eq!(disposition, Some(MessageDisposition::Completed));
    assert_eq!(telemetry.counts(), (1, 1, 1));
    assert_eq!(queue.receive(WAIT).await.unwrap(), None);
}

#[tokio::test]
async fn failed_message_is_abandoned_and_redelivered() {
    let queue = Arc::new(InMemoryQueue::new());
    let (consumer, _telemetry) = consumer_for(ScriptedProcessor::new(), queue.clone()).await;
    enqueue(&queue, Scripted::ReturnFalse).await;

    let shutdown = CancellationToken::new();
    let scope = consumer
        .manager()
        .begin_scope_when_ready(&shutdown)
        .await
        .unwrap();
    let disposition = consumer.run_in_scope(&scope, &shutdown).await;
    scope.close().await;

    assert_eq!(disposition, Some(MessageDisposition::Abandoned));
    let redelivered = queue.receive(WAIT).await.unwrap().unwrap();
    assert_eq!(redelivered.dequeue_count, 2);
}

#[tokio::test]
async fn erroring_message_is_abandoned() {
    let queue = Arc::new(InMemoryQueue::new());
    let (consumer, telemetry) = consumer_for(ScriptedProcessor::new(), queue.clone()).await;
    enqueue(&queue, Scripted::Fail).await;

    let shutdown = CancellationToken::new();
    let scope = consumer
        .manager()
        .begin_scope_when_ready(&shutdown)
        .await
        .unwrap();
    let disposition = consumer.run_in_scope(&scope, &shutdown).await;
    scope.close().await;

    assert_eq!(disposition, Some(MessageDisposition::Abandoned));
    assert_eq!(telemetry.counts(), (1, 0, 1));
}

#[tokio::test(start_paused = true)]
async fn empty_queue_releases_the_scope() {
    let queue = Arc::new(InMemoryQueue::new());
    let (consumer, _telemetry) = consumer_for(ScriptedProcessor::new(), queue).await;

    let shutdown = CancellationToken::new();
    let scope = consumer
        .manager()
        .begin_scope_when_ready(&shutdown)
        .await
        .unwrap();

    assert_eq!(consumer.run_in_scope(&scope, &shutdown).await, None);
}

#[tokio::test(start_paused = true)]
async fn run_drains_queue_and_stops_on_shutdown() {
    let queue = Arc::new(InMemoryQueue::new());
    let processor = ScriptedProcessor::new();
    let (consumer, telemetry) = consumer_for(processor.clone(), queue.clone()).await;
    let state = consumer.manager().state().clone();
    for _ in 0..3 {
        enqueue(&queue, Scripted::Succeed).await;
    }

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processor.completed(), 3);
    assert_eq!(telemetry.counts(), (3, 3, 3));

    // Drain first, then stop the loop.
    state.request_stop_and_drain().await.unwrap();
    assert!(state.wait_until_stopped(Duration::from_secs(1)).await);
    assert_eq!(state.state(), ProcessorState::Stopped);

    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(state.open_scopes(), 0);
}
