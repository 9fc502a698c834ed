//! Durable single-writer store of tasks, agents, file locks, cost events,
//! the action log, and escalations.
//!
//! Generalizes the orchestrator's repository pattern (`TaskRepository` in
//! `agents/orchestrator/result_store.rs`, `SessionStore` in `session/mod.rs`)
//! and its dual-lock atomic transition discipline
//! (`agents/orchestrator/atomic_state.rs`) into one trait with a default
//! in-memory implementation. A SQL-backed implementation is a drop-in
//! replacement behind the same trait.

use crate::bus::{BusEvent, EventBus};
use crate::error::{CoreError, Result};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Typed domain operations over the persisted entities. Every mutation emits
/// a `BusEvent` with `(kind, entity_id, project_id, before?, after)` before
/// returning to the caller.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_project(&self, project: Project) -> Result<()>;
    async fn get_project(&self, id: &str) -> Result<Project>;

    async fn register_agent(&self, agent: AgentProfile) -> Result<()>;
    async fn get_agent(&self, id: &str) -> Result<AgentProfile>;
    async fn list_agents(&self, project_id: &str) -> Result<Vec<AgentProfile>>;
    async fn update_agent_status(&self, id: &str, status: AgentStatus) -> Result<()>;
    async fn record_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn create_task(&self, task: Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Task>;
    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>>;
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        assigned_to: Option<Option<AgentId>>,
    ) -> Result<()>;

    /// Atomic `pending -> claimed` transition. Fails with `Conflict` if the
    /// task isn't `pending`.
    async fn claim_task(&self, task_id: &str, agent_id: &str) -> Result<Task>;

    /// Increments `reassignment_count`, sets `assigned_to`, records metadata.
    async fn reassign_task(&self, task_id: &str, new_agent_id: &str) -> Result<Task>;

    async fn get_task_reassignment_count(&self, task_id: &str) -> Result<u32>;

    /// Tasks in a project whose assignee is offline or has no recorded
    /// heartbeat at all.
    async fn get_orphaned_tasks(&self, project_id: &str) -> Result<Vec<Task>>;

    async fn acquire_lock(&self, path: &str, agent_id: &str, ttl: chrono::Duration) -> Result<FileLock>;
    async fn release_lock(&self, path: &str, agent_id: &str) -> Result<()>;
    async fn sweep_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<FileLock>>;
    async fn list_active_locks(&self) -> Result<Vec<FileLock>>;

    async fn append_cost_event(&self, event: CostEvent) -> Result<()>;
    async fn list_cost_events(&self, project_id: &str) -> Result<Vec<CostEvent>>;

    async fn append_action_log(&self, entry: ActionLogEntry) -> Result<()>;
    async fn list_action_log(&self, project_id: &str) -> Result<Vec<ActionLogEntry>>;

    async fn create_escalation(&self, escalation: Escalation) -> Result<()>;
    async fn update_escalation(&self, escalation: Escalation) -> Result<()>;
    async fn get_escalation(&self, id: &str) -> Result<Escalation>;
    async fn list_escalations(&self, project_id: &str) -> Result<Vec<Escalation>>;
}

#[derive(Default)]
struct Tables {
    projects: HashMap<String, Project>,
    agents: HashMap<String, AgentProfile>,
    tasks: HashMap<String, Task>,
    locks: HashMap<String, FileLock>,
    cost_events: Vec<CostEvent>,
    action_log: Vec<ActionLogEntry>,
    escalations: HashMap<String, Escalation>,
}

pub struct InMemoryStateStore {
    tables: Mutex<Tables>,
    bus: Arc<EventBus>,
}

impl InMemoryStateStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            bus,
        }
    }

    fn emit(
        &self,
        kind: &str,
        entity_id: &str,
        project_id: Option<&str>,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) {
        let mut event = BusEvent::new(kind, entity_id);
        if let Some(project_id) = project_id {
            event = event.with_project(project_id);
        }
        if let Some(before) = before {
            event = event.with_before(before);
        }
        if let Some(after) = after {
            event = event.with_after(after);
        }
        self.bus.publish(event);
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_project(&self, project: Project) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        if tables.projects.contains_key(&project.id) {
            return Err(CoreError::Conflict(format!(
                "project {} already exists",
                project.id
            )));
        }
        let after = serde_json::to_value(&project).ok();
        tables.projects.insert(project.id.clone(), project.clone());
        drop(tables);
        self.emit("project:created", &project.id, Some(&project.id), None, after);
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Project> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        tables
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("project {id}")))
    }

    async fn register_agent(&self, agent: AgentProfile) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        if tables.agents.contains_key(&agent.id) {
            return Err(CoreError::Conflict(format!(
                "agent {} already registered",
                agent.id
            )));
        }
        let after = serde_json::to_value(&agent).ok();
        tables.agents.insert(agent.id.clone(), agent.clone());
        drop(tables);
        self.emit("agent:registered", &agent.id, None, None, after);
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<AgentProfile> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        tables
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))
    }

    async fn list_agents(&self, project_id: &str) -> Result<Vec<AgentProfile>> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        // Agents are project-scoped implicitly through assigned tasks in this
        // in-memory model; a single-project deployment is the common case, so
        // list_agents returns every registered agent for now.
        let _ = project_id;
        Ok(tables.agents.values().cloned().collect())
    }

    async fn update_agent_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let agent = tables
            .agents
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
        let before = serde_json::to_value(&*agent).ok();
        agent.status = status;
        let after = serde_json::to_value(&*agent).ok();
        drop(tables);
        self.emit(&format!("agent:status:{status:?}"), id, None, before, after);
        Ok(())
    }

    async fn record_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let agent = tables
            .agents
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
        agent.last_heartbeat = Some(at);
        drop(tables);
        self.emit("agent:heartbeat", id, None, None, None);
        Ok(())
    }

    async fn create_task(&self, task: Task) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        if tables.tasks.contains_key(&task.id) {
            return Err(CoreError::Conflict(format!("task {} already exists", task.id)));
        }
        let after = serde_json::to_value(&task).ok();
        let project_id = task.project_id.clone();
        tables.tasks.insert(task.id.clone(), task.clone());
        drop(tables);
        self.emit("task:created", &task.id, Some(&project_id), None, after);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        tables
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }

    async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        Ok(tables
            .tasks
            .values()
            .filter(|task| task.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        assigned_to: Option<Option<AgentId>>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let task = tables
            .tasks
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))?;
        let before = serde_json::to_value(&*task).ok();
        task.status = status;
        if let Some(assignee) = assigned_to {
            task.assigned_to = assignee;
        }
        task.updated_at = Utc::now();
        let after = serde_json::to_value(&*task).ok();
        let project_id = task.project_id.clone();
        drop(tables);
        self.emit(
            &format!("task:updated:{status:?}"),
            id,
            Some(&project_id),
            before,
            after,
        );
        Ok(())
    }

    async fn claim_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let task = tables
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "task {task_id} is {:?}, not pending",
                task.status
            )));
        }
        let before = serde_json::to_value(&*task).ok();
        task.status = TaskStatus::Claimed;
        task.assigned_to = Some(agent_id.to_string());
        task.updated_at = Utc::now();
        let after = serde_json::to_value(&*task).ok();
        let claimed = task.clone();
        let project_id = task.project_id.clone();
        drop(tables);
        self.emit("task:updated", task_id, Some(&project_id), before, after);
        Ok(claimed)
    }

    async fn reassign_task(&self, task_id: &str, new_agent_id: &str) -> Result<Task> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let task = tables
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::NotFound(format!("task {task_id}")))?;
        let before = serde_json::to_value(&*task).ok();
        task.assigned_to = Some(new_agent_id.to_string());
        task.status = TaskStatus::Claimed;
        task.reassignment_count += 1;
        task.updated_at = Utc::now();
        let after = serde_json::to_value(&*task).ok();
        let reassigned = task.clone();
        let project_id = task.project_id.clone();
        drop(tables);
        self.emit("task:reassigned", task_id, Some(&project_id), before, after);
        Ok(reassigned)
    }

    async fn get_task_reassignment_count(&self, task_id: &str) -> Result<u32> {
        Ok(self.get_task(task_id).await?.reassignment_count)
    }

    async fn get_orphaned_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        let orphaned = tables
            .tasks
            .values()
            .filter(|task| task.project_id == project_id)
            .filter(|task| matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress))
            .filter(|task| {
                task.assigned_to
                    .as_ref()
                    .and_then(|agent_id| tables.agents.get(agent_id))
                    .map(|agent| agent.status == AgentStatus::Offline)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        Ok(orphaned)
    }

    async fn acquire_lock(&self, path: &str, agent_id: &str, ttl: chrono::Duration) -> Result<FileLock> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let now = Utc::now();

        if let Some(existing) = tables.locks.get(path) {
            if !existing.is_expired(now) && existing.agent_id != agent_id {
                return Err(CoreError::Conflict(format!(
                    "{path} is locked by {}",
                    existing.agent_id
                )));
            }
        }

        let lock = FileLock {
            file_path: path.to_string(),
            agent_id: agent_id.to_string(),
            locked_at: now,
            expires_at: now + ttl,
        };
        tables.locks.insert(path.to_string(), lock.clone());
        drop(tables);
        self.emit("lock:acquired", path, None, None, serde_json::to_value(&lock).ok());
        Ok(lock)
    }

    async fn release_lock(&self, path: &str, agent_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        match tables.locks.get(path) {
            Some(lock) if lock.agent_id == agent_id => {
                tables.locks.remove(path);
                drop(tables);
                self.emit("lock:released", path, None, None, None);
                Ok(())
            }
            Some(_) => Err(CoreError::Conflict(format!(
                "{path} is not locked by {agent_id}"
            ))),
            None => Ok(()),
        }
    }

    async fn sweep_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<FileLock>> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let expired: Vec<FileLock> = tables
            .locks
            .values()
            .filter(|lock| lock.is_expired(now))
            .cloned()
            .collect();
        for lock in &expired {
            tables.locks.remove(&lock.file_path);
        }
        drop(tables);
        for lock in &expired {
            self.emit("lock:expired", &lock.file_path, None, None, None);
        }
        Ok(expired)
    }

    async fn list_active_locks(&self) -> Result<Vec<FileLock>> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        let now = Utc::now();
        Ok(tables
            .locks
            .values()
            .filter(|lock| !lock.is_expired(now))
            .cloned()
            .collect())
    }

    async fn append_cost_event(&self, event: CostEvent) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let project_id = event.project_id.clone();
        let after = serde_json::to_value(&event).ok();
        tables.cost_events.push(event.clone());
        drop(tables);
        self.emit("cost:recorded", &event.id, Some(&project_id), None, after);
        Ok(())
    }

    async fn list_cost_events(&self, project_id: &str) -> Result<Vec<CostEvent>> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        Ok(tables
            .cost_events
            .iter()
            .filter(|event| event.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn append_action_log(&self, entry: ActionLogEntry) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let project_id = entry.project_id.clone();
        let after = serde_json::to_value(&entry).ok();
        tables.action_log.push(entry.clone());
        drop(tables);
        self.emit("action:logged", &entry.id, Some(&project_id), None, after);
        Ok(())
    }

    async fn list_action_log(&self, project_id: &str) -> Result<Vec<ActionLogEntry>> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        Ok(tables
            .action_log
            .iter()
            .filter(|entry| entry.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn create_escalation(&self, escalation: Escalation) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let project_id = escalation.project_id.clone();
        let after = serde_json::to_value(&escalation).ok();
        tables
            .escalations
            .insert(escalation.id.clone(), escalation.clone());
        drop(tables);
        self.emit("escalation", &escalation.id, Some(&project_id), None, after);
        Ok(())
    }

    async fn update_escalation(&self, escalation: Escalation) -> Result<()> {
        let mut tables = self.tables.lock().expect("state store lock poisoned");
        let before = tables
            .escalations
            .get(&escalation.id)
            .and_then(|e| serde_json::to_value(e).ok());
        let project_id = escalation.project_id.clone();
        let after = serde_json::to_value(&escalation).ok();
        tables
            .escalations
            .insert(escalation.id.clone(), escalation.clone());
        drop(tables);
        self.emit("escalation", &escalation.id, Some(&project_id), before, after);
        Ok(())
    }

    async fn get_escalation(&self, id: &str) -> Result<Escalation> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        tables
            .escalations
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("escalation {id}")))
    }

    async fn list_escalations(&self, project_id: &str) -> Result<Vec<Escalation>> {
        let tables = self.tables.lock().expect("state store lock poisoned");
        Ok(tables
            .escalations
            .values()
            .filter(|escalation| escalation.project_id == project_id)
            .cloned()
            .collect())
    }
}
