//! Reassigns orphaned tasks from offline agents after a grace period.
//!
//! Grounded on `monitoring/mod.rs`'s background-task/shutdown-handle pattern
//! (one `tokio::spawn`ed timer per unit of work, tracked so `stop()` can
//! drain them) and delegates agent selection to the capability matcher.

use crate::bus::EventBus;
use crate::capability::{find_best_agent, FindBestAgentOptions};
use crate::models::{extract_required_capabilities, AgentStatus, TaskId};
use crate::store::StateStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const DEFAULT_GRACE_PERIOD_MS: u64 = 300_000;
pub const DEFAULT_MAX_REASSIGNMENTS: u32 = 3;

pub struct TaskReassigner {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    grace_period: Duration,
    max_reassignments: u32,
    pending: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl TaskReassigner {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            max_reassignments: DEFAULT_MAX_REASSIGNMENTS,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_max_reassignments(mut self, max: u32) -> Self {
        self.max_reassignments = max;
        self
    }

    /// Handles a `status:offline` event for `agent_id`: schedules a
    /// grace-period timer for each orphaned in-progress task not already
    /// pending reassignment.
    pub async fn on_agent_offline(self: &Arc<Self>, project_id: String, agent_id: String) -> crate::error::Result<()> {
        let orphaned = self.store.get_orphaned_tasks(&project_id).await?;

        for task in orphaned {
            if task.assigned_to.as_deref() != Some(agent_id.as_str()) {
                continue;
            }

            let mut pending = self.pending.lock().await;
            if pending.contains_key(&task.id) {
                continue;
            }

            if task.reassignment_count >= self.max_reassignments {
                self.bus.publish(crate::bus::BusEvent::new(
                    "reassignment:max-reached",
                    task.id.clone(),
                ));
                continue;
            }

            let reassigner = self.clone();
            let task_id = task.id.clone();
            let original_agent = agent_id.clone();
            let project_id = project_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(reassigner.grace_period).await;
                reassigner
                    .fire(project_id, task_id, original_agent)
                    .await;
            });
            pending.insert(task.id.clone(), handle);
        }

        Ok(())
    }

    async fn fire(self: Arc<Self>, project_id: String, task_id: TaskId, original_agent: String) {
        self.pending.lock().await.remove(&task_id);

        let agent = match self.store.get_agent(&original_agent).await {
            Ok(agent) => agent,
            Err(err) => {
                warn!("reassigner: could not reload agent {original_agent}: {err}");
                return;
            }
        };
        if agent.status != AgentStatus::Offline {
            info!("reassigner: {original_agent} recovered before grace period elapsed, cancelling");
            return;
        }

        let _ = self.reassign_now(&project_id, &task_id, &original_agent).await;
    }

    /// Synchronous reassignment path used directly by the action executor's
    /// `reassign_task` action (§4.11), bypassing the grace-period timer:
    /// re-checks `maxReassignments`, runs the capability matcher over the
    /// project's agents excluding `exclude_agent_id`, and either reassigns
    /// atomically in the store (publishing `reassignment`) or publishes
    /// `reassignment:failed` with a reason. Unlike the timer-driven path,
    /// this does not re-check that the excluded agent is still offline —
    /// the caller already decided reassignment is warranted.
    pub async fn reassign_now(
        &self,
        project_id: &str,
        task_id: &str,
        exclude_agent_id: &str,
    ) -> crate::error::Result<crate::models::Task> {
        let task = self.store.get_task(task_id).await?;

        if task.reassignment_count >= self.max_reassignments {
            self.bus.publish(crate::bus::BusEvent::new(
                "reassignment:max-reached",
                task_id.to_string(),
            ));
            return Err(crate::error::CoreError::Conflict(format!(
                "task {task_id} has reached the maximum reassignment count"
            )));
        }

        let required = extract_required_capabilities(&task.tags, Some(&task.metadata));
        let agents = self.store.list_agents(project_id).await?;

        let mut exclude: HashSet<String> = HashSet::new();
        exclude.insert(exclude_agent_id.to_string());
        let options = FindBestAgentOptions {
            exclude_agent_ids: exclude,
            min_score: 0.0,
        };

        match find_best_agent(&agents, &required, &options) {
            Some((candidate, _)) => {
                let candidate_id = candidate.id.clone();
                match self.store.reassign_task(task_id, &candidate_id).await {
                    Ok(reassigned) => {
                        self.bus.publish(crate::bus::BusEvent::new(
                            "reassignment",
                            task_id.to_string(),
                        ));
                        Ok(reassigned)
                    }
                    Err(err) => {
                        self.bus.publish(
                            crate::bus::BusEvent::new("reassignment:failed", task_id.to_string())
                                .with_after(serde_json::json!({ "reason": err.to_string() })),
                        );
                        Err(err)
                    }
                }
            }
            None => {
                self.bus.publish(
                    crate::bus::BusEvent::new("reassignment:failed", task_id.to_string())
                        .with_after(serde_json::json!({ "reason": "no eligible agent" })),
                );
                Err(crate::error::CoreError::Conflict(format!(
                    "no eligible agent to reassign task {task_id} to"
                )))
            }
        }
    }

    /// Cancels all scheduled grace-period timers without letting them fire.
    pub async fn stop(&self) {
        let mut pending = self.pending.lock().await;
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }
}
