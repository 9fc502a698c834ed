//! Executes approved/autonomous decisions against the state store and a
//! narrow agent-messaging client, logging every attempt.
//!
//! Retry discipline (at most 2 attempts, fixed backoff) is grounded on the
//! circuit breaker's failure-threshold bookkeeping in
//! `claude_code/circuit_breaker.rs`, simplified from a stateful breaker to a
//! per-call bounded retry loop since actions are executed one at a time
//! rather than behind a shared gate.

use crate::bus::{BusEvent, EventBus};
use crate::error::{CoreError, Result};
use crate::models::{ActionOutcome, ActionLogEntry, ActionType, DetectionEvent, ProjectId, TaskId};
use crate::queue::TaskQueueManager;
use crate::reassigner::TaskReassigner;
use crate::store::StateStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const MAX_ACTION_RETRIES: u32 = 2;
pub const ACTION_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Narrow client for the side effects this executor cannot express purely
/// through the state store (sending a prompt/heartbeat to a live agent,
/// requesting sandbox recreation). A production implementation talks to the
/// sandbox manager and agent transport; tests use a fake.
#[async_trait]
pub trait AgentMessenger: Send + Sync {
    async fn send_prompt(&self, agent_id: &str, message: &str) -> Result<()>;
    async fn request_restart(&self, agent_id: &str) -> Result<()>;
}

pub struct ActionExecutor {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    queue: Arc<TaskQueueManager>,
    reassigner: Arc<TaskReassigner>,
    messenger: Arc<dyn AgentMessenger>,
}

impl ActionExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        queue: Arc<TaskQueueManager>,
        reassigner: Arc<TaskReassigner>,
        messenger: Arc<dyn AgentMessenger>,
    ) -> Self {
        Self {
            store,
            bus,
            queue,
            reassigner,
            messenger,
        }
    }

    /// Executes `action_type` for `project_id` in response to `trigger`,
    /// retrying transient failures up to [`MAX_ACTION_RETRIES`] times with a
    /// fixed backoff, then writes exactly one [`ActionLogEntry`].
    pub async fn execute(
        &self,
        project_id: &ProjectId,
        action_type: ActionType,
        trigger: &DetectionEvent,
        task_id: Option<&TaskId>,
    ) -> Result<ActionLogEntry> {
        let mut attempt = 0;
        let mut last_error = None;

        loop {
            match self.dispatch(action_type, trigger, task_id).await {
                Ok(details) => {
                    let entry = self
                        .log_outcome(project_id, action_type, trigger, ActionOutcome::Success, Some(details))
                        .await?;
                    return Ok(entry);
                }
                Err(CoreError::Transient(reason)) if attempt < MAX_ACTION_RETRIES => {
                    attempt += 1;
                    last_error = Some(reason);
                    tokio::time::sleep(ACTION_RETRY_BACKOFF).await;
                }
                Err(err) => {
                    let entry = self
                        .log_outcome(
                            project_id,
                            action_type,
                            trigger,
                            ActionOutcome::Failure,
                            Some(err.to_string()),
                        )
                        .await?;
                    let _ = last_error;
                    return Ok(entry);
                }
            }
        }
    }

    async fn dispatch(
        &self,
        action_type: ActionType,
        trigger: &DetectionEvent,
        task_id: Option<&TaskId>,
    ) -> Result<String> {
        match action_type {
            ActionType::PromptAgent => {
                self.messenger
                    .send_prompt(&trigger.agent_id, "checking in: are you still making progress?")
                    .await?;
                Ok(format!("prompted {}", trigger.agent_id))
            }
            ActionType::RetryTask => {
                let task_id = task_id.ok_or_else(|| {
                    CoreError::Validation("retry_task requires a task id".to_string())
                })?;
                let task = self.store.get_task(task_id).await?;
                let assigned_to = if matches!(task.status, crate::models::TaskStatus::Failed) {
                    Some(None)
                } else {
                    None
                };
                self.store
                    .update_task_status(
                        task_id,
                        match task.status {
                            crate::models::TaskStatus::Blocked => crate::models::TaskStatus::InProgress,
                            _ => crate::models::TaskStatus::Pending,
                        },
                        assigned_to,
                    )
                    .await?;
                Ok(format!("retried task {task_id}"))
            }
            ActionType::RestartAgent => {
                self.messenger.request_restart(&trigger.agent_id).await?;
                Ok(format!("restarted {}", trigger.agent_id))
            }
            ActionType::ReassignTask => {
                let task_id = task_id.ok_or_else(|| {
                    CoreError::Validation("reassign_task requires a task id".to_string())
                })?;
                let project_id = self.store.get_task(task_id).await?.project_id;
                let reassigned = self
                    .reassigner
                    .reassign_now(&project_id, task_id, &trigger.agent_id)
                    .await?;
                Ok(format!(
                    "reassigned task {task_id} to {}",
                    reassigned.assigned_to.as_deref().unwrap_or("?")
                ))
            }
            ActionType::CleanupLocks => {
                let swept = self.queue.sweep_expired().await?;
                Ok(format!("swept {swept} expired locks"))
            }
            ActionType::ForceReleaseLock => {
                let task_id = task_id.ok_or_else(|| {
                    CoreError::Validation("force_release_lock requires a task id".to_string())
                })?;
                let task = self.store.get_task(task_id).await?;
                for path in &task.files {
                    // Force release does not require the caller to be the
                    // lock's holder; ownership is irrelevant here.
                    if let Err(err) = self.store.release_lock(path, &trigger.agent_id).await {
                        warn!("force_release_lock: {path}: {err}");
                    }
                }
                Ok(format!("force-released locks for task {task_id}"))
            }
        }
    }

    async fn log_outcome(
        &self,
        project_id: &ProjectId,
        action_type: ActionType,
        trigger: &DetectionEvent,
        outcome: ActionOutcome,
        outcome_details: Option<String>,
    ) -> Result<ActionLogEntry> {
        let entry = ActionLogEntry {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.clone(),
            action: action_type,
            trigger_event: trigger.clone(),
            outcome,
            outcome_details,
            executed_at: chrono::Utc::now(),
        };
        self.store.append_action_log(entry.clone()).await?;
        self.bus
            .publish(BusEvent::new("action", entry.id.clone()).with_project(project_id.clone()));
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::models::*;
    use crate::store::InMemoryStateStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeMessenger {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl AgentMessenger for FakeMessenger {
        async fn send_prompt(&self, _agent_id: &str, _message: &str) -> Result<()> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(CoreError::Transient("agent transport unavailable".into()));
            }
            Ok(())
        }

        async fn request_restart(&self, _agent_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn trigger() -> DetectionEvent {
        DetectionEvent {
            agent_id: "a1".into(),
            sandbox_id: "sb1".into(),
            timestamp: chrono::Utc::now(),
            kind: DetectionKind::Error {
                severity: ErrorSeverity::Error,
                message: "x".into(),
            },
        }
    }

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            project_id: "p1".into(),
            title: "t".into(),
            description: "t".into(),
            status,
            priority: Priority::Medium,
            assigned_to: Some("a1".into()),
            dependencies: vec![],
            files: vec![],
            tags: vec![],
            metadata: HashMap::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            reassignment_count: 0,
        }
    }

    fn executor(messenger: Arc<dyn AgentMessenger>) -> (ActionExecutor, Arc<dyn StateStore>) {
        let bus = Arc::new(EventBus::new());
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(bus.clone()));
        let queue = Arc::new(TaskQueueManager::new(store.clone()));
        let reassigner = Arc::new(TaskReassigner::new(store.clone(), bus.clone()));
        (
            ActionExecutor::new(store.clone(), bus, queue, reassigner, messenger),
            store,
        )
    }

    #[tokio::test]
    async fn prompt_agent_writes_exactly_one_success_log_entry() {
        let (executor, store) = executor(Arc::new(FakeMessenger {
            fail_times: AtomicU32::new(0),
        }));
        let entry = executor
            .execute(&"p1".to_string(), ActionType::PromptAgent, &trigger(), None)
            .await
            .unwrap();
        assert_eq!(entry.outcome, ActionOutcome::Success);

        let log = store.list_action_log("p1").await.unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let (executor, _store) = executor(Arc::new(FakeMessenger {
            fail_times: AtomicU32::new(2),
        }));
        let entry = executor
            .execute(&"p1".to_string(), ActionType::PromptAgent, &trigger(), None)
            .await
            .unwrap();
        assert_eq!(entry.outcome, ActionOutcome::Success);
    }

    #[tokio::test]
    async fn exhausted_retries_log_failure_outcome() {
        let (executor, _store) = executor(Arc::new(FakeMessenger {
            fail_times: AtomicU32::new(10),
        }));
        let entry = executor
            .execute(&"p1".to_string(), ActionType::PromptAgent, &trigger(), None)
            .await
            .unwrap();
        assert_eq!(entry.outcome, ActionOutcome::Failure);
    }

    #[tokio::test]
    async fn retry_task_transitions_failed_task_to_pending_and_clears_assignee() {
        let (executor, store) = executor(Arc::new(FakeMessenger {
            fail_times: AtomicU32::new(0),
        }));
        store.create_task(task("t1", TaskStatus::Failed)).await.unwrap();

        executor
            .execute(&"p1".to_string(), ActionType::RetryTask, &trigger(), Some(&"t1".to_string()))
            .await
            .unwrap();

        let task = store.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_to.is_none());
    }

    #[tokio::test]
    async fn reassign_task_dispatches_synchronously_to_an_eligible_agent() {
        let (executor, store) = executor(Arc::new(FakeMessenger {
            fail_times: AtomicU32::new(0),
        }));
        store
            .register_agent(AgentProfile {
                id: "a1".into(),
                name: "a1".into(),
                provider: AgentProvider::Anthropic,
                model: "m".into(),
                capabilities: std::collections::HashSet::new(),
                cost_per_token: CostPerToken { input: 0.0, output: 0.0 },
                status: AgentStatus::Offline,
                last_heartbeat: Some(chrono::Utc::now()),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        store
            .register_agent(AgentProfile {
                id: "a2".into(),
                name: "a2".into(),
                provider: AgentProvider::Anthropic,
                model: "m".into(),
                capabilities: std::collections::HashSet::new(),
                cost_per_token: CostPerToken { input: 0.0, output: 0.0 },
                status: AgentStatus::Idle,
                last_heartbeat: Some(chrono::Utc::now()),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        store.create_task(task("t1", TaskStatus::InProgress)).await.unwrap();

        let entry = executor
            .execute(&"p1".to_string(), ActionType::ReassignTask, &trigger(), Some(&"t1".to_string()))
            .await
            .unwrap();
        assert_eq!(entry.outcome, ActionOutcome::Success);

        let reassigned = store.get_task("t1").await.unwrap();
        assert_eq!(reassigned.assigned_to.as_deref(), Some("a2"));
        assert_eq!(reassigned.reassignment_count, 1);
    }
}
