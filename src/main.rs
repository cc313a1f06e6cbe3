use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use work_item_engine::config::EngineConfig;
use work_item_engine::processor::{HeartbeatProcessor, HeartbeatWorkItem, ProcessorRegistry};
use work_item_engine::scope::WorkItemScopeManager;
use work_item_engine::server::{AppState, build_router};
use work_item_engine::state::{ProcessorState, ReplicaState, run_state_sync};
use work_item_engine::telemetry::TracingTelemetry;
use work_item_engine::types::{WorkItem, encode_work_item};
use work_item_engine::worker::{InMemoryQueue, WorkItemConsumer, WorkQueue};
use work_item_engine::{InMemoryStore, ReplicaId};

/// How long Ctrl-C waits for in-flight work before giving up on the drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "work_item_engine=debug,work_item_host=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env()?;
    info!(replica = %config.replica, limit = ?config.limit, workers = config.workers, "Starting work item host");

    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new());

    let registry = ProcessorRegistry::builder()
        .register_default::<HeartbeatWorkItem, HeartbeatProcessor>()
        .build()?;
    registry.ensure_resolvable([HeartbeatWorkItem::WORK_ITEM_TYPE])?;

    let state = Arc::new(ReplicaState::new(config.replica.clone(), store));
    let manager = WorkItemScopeManager::new(
        state.clone(),
        registry.clone(),
        Arc::new(TracingTelemetry),
    )
    .with_limit(config.limit)
    .with_mutex_ttl(config.mutex_ttl);

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::with_capacity(config.workers + 1);
    for worker in 0..config.workers {
        let consumer =
            WorkItemConsumer::new(worker, manager.clone(), queue.clone(), config.receive_wait);
        tasks.push(tokio::spawn(consumer.run(shutdown.clone())));
    }
    tasks.push(tokio::spawn(run_state_sync(
        state.clone(),
        config.state_sync_interval,
        shutdown.clone(),
    )));

    state.mark_initializing_done().await?;
    state.start().await?;
    queue
        .send(encode_work_item(&HeartbeatWorkItem::now())?)
        .await?;

    let app = build_router(AppState::new(state.clone(), registry, queue));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(drain_on_ctrl_c(
            state.clone(),
            config.replica.clone(),
            shutdown.clone(),
        ))
        .await?;

    for task in tasks {
        task.await?;
    }
    state.dispose();
    info!("Work item host stopped");
    Ok(())
}

/// Waits for Ctrl-C, drains the replica, then cancels the worker loops.
async fn drain_on_ctrl_c(
    state: Arc<ReplicaState<InMemoryStore>>,
    replica: ReplicaId,
    shutdown: CancellationToken,
) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C; shutting down");
    }
    info!(replica = %replica, "Ctrl-C received, draining");

    match state.request_stop_and_drain().await {
        Ok(ProcessorState::Stopped) => {}
        Ok(_) => {
            if !state.wait_until_stopped(DRAIN_TIMEOUT).await {
                warn!(open_scopes = state.open_scopes(), "Drain timed out; shutting down anyway");
            }
        }
        Err(e) => warn!(error = %e, "Drain request failed"),
    }
    shutdown.cancel();
}
