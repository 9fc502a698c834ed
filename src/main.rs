//! Binary entrypoint: loads configuration, wires every core component, and
//! serves the HTTP/SSE surface until interrupted.
//!
//! Grounded on the orchestrator's original `main.rs` (config load, tracing
//! init, component construction, `tokio::select!` over long-running
//! futures); generalized from the Discord/Claude-specific orchestrator to
//! this crate's own component graph.

use agent_coord_core::actions::{ActionExecutor, AgentMessenger};
use agent_coord_core::api::{ApiServer, AppState};
use agent_coord_core::budget::BudgetLedger;
use agent_coord_core::bus::EventBus;
use agent_coord_core::config::{CoreConfig, SandboxBackendKind};
use agent_coord_core::decision::{AgentState, DecisionEngine};
use agent_coord_core::detectors::PatternMatcher;
use agent_coord_core::escalation::EscalationQueue;
use agent_coord_core::error::Result;
use agent_coord_core::health::{HealthMonitor, HealthThresholds};
use agent_coord_core::models::{AutonomyLevel, DecisionAction, DetectionEvent, TaskStatus};
use agent_coord_core::queue::TaskQueueManager;
use agent_coord_core::reassigner::TaskReassigner;
use agent_coord_core::sandbox::local::LocalProcessBackend;
use agent_coord_core::sandbox::{SandboxBackend, SandboxManager};
use agent_coord_core::store::{InMemoryStateStore, StateStore};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "agent-coord-core", about = "Coordination core for multi-agent coding task orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load configuration, wire every component, and serve the HTTP/SSE surface (default).
    Serve,
}

/// Placeholder agent transport: logs what would be sent rather than
/// delivering it. Real agent delivery (prompting a live coding agent,
/// requesting a sandbox restart) is an external integration left for the
/// deployment to wire in; this keeps `ActionExecutor` fully exercised without
/// inventing an undocumented wire protocol.
struct LoggingMessenger;

#[async_trait]
impl AgentMessenger for LoggingMessenger {
    async fn send_prompt(&self, agent_id: &str, message: &str) -> Result<()> {
        info!(agent_id, message, "would send prompt to agent");
        Ok(())
    }

    async fn request_restart(&self, agent_id: &str) -> Result<()> {
        info!(agent_id, "would request agent restart");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await?,
    }

    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    info!("starting agent coordination core");

    let config = CoreConfig::load()?;
    let project_id = config.project_id.clone();

    let bus = Arc::new(EventBus::new());
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(bus.clone()));

    let health_thresholds = HealthThresholds::from(config.health_thresholds);
    let health_monitor = Arc::new(HealthMonitor::new(store.clone(), bus.clone(), health_thresholds));
    health_monitor.start(project_id.clone()).await;

    let reassigner = Arc::new(
        TaskReassigner::new(store.clone(), bus.clone())
            .with_grace_period(std::time::Duration::from_millis(config.reassignment_grace_period_ms))
            .with_max_reassignments(config.max_reassignments),
    );

    let queue = Arc::new(
        TaskQueueManager::new(store.clone())
            .with_lock_ttl(chrono::Duration::minutes(config.lock_ttl_minutes)),
    );

    let sandbox_backend: Arc<dyn SandboxBackend> = match config.sandbox.backend {
        SandboxBackendKind::Local => Arc::new(LocalProcessBackend::new(PathBuf::from(&config.sandbox.base_dir))),
        SandboxBackendKind::Remote => {
            warn!("SANDBOX_BACKEND=remote has no bundled backend implementation; falling back to local");
            Arc::new(LocalProcessBackend::new(PathBuf::from(&config.sandbox.base_dir)))
        }
    };
    // No caller within this binary drives sandbox execution yet (that's an
    // external agent-runner concern, per `LoggingMessenger`'s doc comment);
    // kept alive so a future admin surface can hand out sandboxes without
    // re-plumbing construction.
    let _sandbox_manager = SandboxManager::new(sandbox_backend, bus.clone(), config.sandbox.max_concurrent);

    let escalations = Arc::new(EscalationQueue::new(store.clone()));
    let budget = Arc::new(BudgetLedger::new(store.clone(), escalations.clone()));

    let messenger: Arc<dyn AgentMessenger> = Arc::new(LoggingMessenger);
    let actions = Arc::new(ActionExecutor::new(
        store.clone(),
        bus.clone(),
        queue.clone(),
        reassigner.clone(),
        messenger,
    ));

    let decision_engine = Arc::new(DecisionEngine::new());
    let _pattern_matcher = Arc::new(PatternMatcher::with_config(
        config.ring_buffer_capacity,
        config.silence_threshold_ms,
    ));

    spawn_offline_reassignment_bridge(project_id.clone(), bus.clone(), reassigner.clone());
    spawn_observer_pipeline(
        project_id.clone(),
        bus.clone(),
        store.clone(),
        decision_engine,
        actions,
        escalations.clone(),
    );

    let api_state = AppState {
        project_id,
        store: store.clone(),
        bus: bus.clone(),
        escalations: escalations.clone(),
        budget: budget.clone(),
    };
    let api_server = ApiServer::new(api_state, config.api.clone());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    tokio::select! {
        result = api_server.run() => {
            if let Err(err) = result {
                tracing::error!("API server failed: {err}");
            }
        }
        _ = shutdown => {}
    }

    health_monitor.shutdown().await;

    Ok(())
}

/// Closes the `heartbeats -> health monitor -> reassigner` loop: every
/// `status:offline` event the health monitor publishes triggers the
/// reassigner's grace-period timer for that agent's in-flight tasks.
fn spawn_offline_reassignment_bridge(project_id: String, bus: Arc<EventBus>, reassigner: Arc<TaskReassigner>) {
    tokio::spawn(async move {
        let mut subscription = bus.subscribe(vec!["status:offline".to_string()]);
        while let Some(event) = subscription.recv().await {
            if event.entity_id.is_empty() {
                continue;
            }
            if let Err(err) = reassigner
                .on_agent_offline(project_id.clone(), event.entity_id.clone())
                .await
            {
                tracing::error!(agent_id = %event.entity_id, "failed to start reassignment grace period: {err}");
            }
        }
    });
}

/// Closes the `sandbox output -> pattern detectors -> decision engine ->
/// (autonomous action | escalation)` loop. Detection events arrive as
/// `detection:<kind>` bus events (published by the sandbox manager's
/// streaming chunk sink); this task decodes each one, looks up (or starts)
/// that agent's decision state, asks the decision engine what to do, and
/// dispatches the result.
///
/// `DetectionEvent` carries no task id, so the triggering task is inferred
/// as the agent's current in-progress task, if any — the same task a prompt
/// or retry action would target. This heuristic is recorded in DESIGN.md.
fn spawn_observer_pipeline(
    project_id: String,
    bus: Arc<EventBus>,
    store: Arc<dyn StateStore>,
    decision_engine: Arc<DecisionEngine>,
    actions: Arc<ActionExecutor>,
    escalations: Arc<EscalationQueue>,
) {
    tokio::spawn(async move {
        let mut subscription = bus.subscribe(vec!["detection:*".to_string()]);
        let agent_states: Mutex<HashMap<String, AgentState>> = Mutex::new(HashMap::new());

        while let Some(bus_event) = subscription.recv().await {
            let Some(after) = bus_event.after.clone() else {
                continue;
            };
            let event: DetectionEvent = match serde_json::from_value(after) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!("failed to decode detection event from bus: {err}");
                    continue;
                }
            };

            let autonomy_level = store
                .get_project(&project_id)
                .await
                .map(|project| project.autonomy_level)
                .unwrap_or(AutonomyLevel::Manual);

            let triggering_task_id = match store.list_tasks(&project_id).await {
                Ok(tasks) => tasks
                    .into_iter()
                    .find(|task| task.assigned_to.as_deref() == Some(event.agent_id.as_str()) && task.status == TaskStatus::InProgress)
                    .map(|task| task.id),
                Err(err) => {
                    tracing::warn!("failed to list tasks while routing detection event: {err}");
                    None
                }
            };

            let decision = {
                let mut states = agent_states.lock().await;
                let state = states.entry(event.agent_id.clone()).or_default();
                decision_engine.decide(&event, state, triggering_task_id.as_ref(), autonomy_level)
            };

            match decision.action {
                DecisionAction::Autonomous => {
                    let Some(action_type) = decision.action_type else {
                        continue;
                    };
                    match actions
                        .execute(&project_id, action_type, &event, triggering_task_id.as_ref())
                        .await
                    {
                        Ok(entry) => {
                            if entry.outcome == agent_coord_core::models::ActionOutcome::Success {
                                let mut states = agent_states.lock().await;
                                let state = states.entry(event.agent_id.clone()).or_default();
                                decision_engine.record_success(state, action_type, triggering_task_id.as_ref());
                            }
                        }
                        Err(err) => {
                            tracing::error!(agent_id = %event.agent_id, "action execution failed: {err}");
                        }
                    }
                }
                DecisionAction::Escalate => {
                    if let Err(err) = escalations
                        .create_from_detection(&project_id, &event, decision.action, &[])
                        .await
                    {
                        tracing::error!(agent_id = %event.agent_id, "failed to create escalation: {err}");
                    }
                }
                DecisionAction::Ignore => {}
            }
        }
    });
}
