use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use agent_runtime::config::RuntimeConfig;
use agent_runtime::connection::{ConnectionState, ConnectionStateManager};
use agent_runtime::error::{CheckpointError, EngineError, ExecutionError};
use agent_runtime::task::{Executor, TaskDefinition, TaskEngine};

const DEMO_SESSION: &str = "local";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = init_tracing();

    let config = RuntimeConfig::from_env()?;

    eprintln!("⚙️  Agent Runtime v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Tasks: max {} concurrent, default timeout {}s",
        config.engine.max_concurrent_tasks,
        config.engine.default_timeout.as_secs()
    );
    if config.engine.enable_checkpoints {
        eprintln!(
            "   Checkpoints: {}",
            config.engine.checkpoint_storage_path.display()
        );
    } else {
        eprintln!("   Checkpoints: disabled");
    }
    eprintln!(
        "   Connections: heartbeat {}s, timeout {}s, {} reconnects",
        config.connections.heartbeat_interval.as_secs(),
        config.connections.connection_timeout.as_secs(),
        config.connections.max_reconnect_attempts
    );

    let engine = TaskEngine::new(config.engine.clone());
    let connections = ConnectionStateManager::new(config.connections.clone());

    engine.add_completion_listener(Arc::new(|result| {
        tracing::info!(
            task_id = %result.task_id,
            status = %result.status,
            attempts = result.attempts,
            "Task finished"
        );
        Ok(())
    }));
    connections.add_state_change_listener(Arc::new(|session_id, from, to| {
        tracing::info!(session_id = %session_id, from = %from, to = %to, "Session state");
        Ok(())
    }));

    engine.start();
    connections.start();

    run_demo(&engine, &connections).await?;

    tracing::info!(
        engine = %serde_json::to_string(&engine.get_statistics().await)?,
        connections = %serde_json::to_string(&connections.get_statistics().await)?,
        "Runtime statistics"
    );

    eprintln!("   Press Ctrl-C to exit.\n");
    tokio::signal::ctrl_c().await?;

    connections.stop().await;
    engine.stop().await;
    Ok(())
}

/// Heartbeat a local session through one task, then snapshot its final state.
async fn run_demo(
    engine: &TaskEngine,
    connections: &ConnectionStateManager,
) -> agent_runtime::error::Result<()> {
    connections.register_connection(DEMO_SESSION).await;
    connections
        .set_connection_state(DEMO_SESSION, ConnectionState::Connected)
        .await;

    let task_id = engine.submit(heartbeat_task(connections.clone())).await?;
    match engine
        .wait_for_task(&task_id, Some(Duration::from_secs(60)))
        .await?
    {
        Some(result) => eprintln!("   Demo task {}: {}", task_id, result.status),
        None => eprintln!("   Demo task {} did not finish in time", task_id),
    }

    match engine.checkpoint_task(&task_id).await {
        Ok(checkpoint_id) => eprintln!("   Final checkpoint: {}", checkpoint_id),
        Err(EngineError::Checkpoint(CheckpointError::Unavailable)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Stdout logging, or daily-rotated files when `AGENT_RUNTIME_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("AGENT_RUNTIME_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-runtime.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

/// Beats the demo session a few times, reporting progress, then checkpoints.
fn heartbeat_task(connections: ConnectionStateManager) -> TaskDefinition {
    TaskDefinition::new(
        "heartbeat",
        Executor::from_async(move |params, ctx| {
            let connections = connections.clone();
            async move {
                let beats = params.get("beats").and_then(Value::as_u64).unwrap_or(4).max(1);
                for beat in 1..=beats {
                    if ctx.should_cancel() {
                        return Err(ExecutionError::Cancelled);
                    }
                    ctx.wait_if_paused().await;

                    connections.update_heartbeat(DEMO_SESSION).await;
                    connections.increment_message_count(DEMO_SESSION).await;
                    ctx.set_data("beats_sent", json!(beat));
                    ctx.report_progress((beat * 100 / beats) as i32, format!("beat {beat}/{beats}"), None)
                        .await
                        .map_err(|e| ExecutionError::Other(e.into()))?;

                    tokio::time::sleep(Duration::from_millis(250)).await;
                }

                let checkpoint = ctx
                    .create_checkpoint(true)
                    .await
                    .map_err(|e| ExecutionError::Other(e.into()))?;
                Ok::<_, ExecutionError>(json!({ "beats": beats, "checkpoint": checkpoint }))
            }
        }),
    )
    .with_description("Heartbeat the local demo session")
    .with_parameter("beats", json!(4))
    .with_timeout(Duration::from_secs(30))
}
