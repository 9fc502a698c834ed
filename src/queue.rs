//! Task claim protocol: zone-checked, all-or-nothing multi-file locking on
//! top of the state store's single-path lock primitive.
//!
//! Grounded on `agents/orchestrator/task_queue.rs`'s `TaskQueue` (claim/size
//! bookkeeping) and the lease/TTL discipline in `session/mod.rs`'s
//! `SessionManager` (acquire with TTL, auto-extend on re-entry).

use crate::error::{CoreError, Result};
use crate::models::{ConflictStrategy, Task, TaskStatus};
use crate::store::StateStore;
use crate::zones::ZoneMatcher;
use chrono::Duration;
use std::sync::Arc;

pub const DEFAULT_LOCK_TTL_MINUTES: i64 = 30;
pub const LOCK_SWEEP_INTERVAL_SECS: u64 = 60;

pub struct TaskQueueManager {
    store: Arc<dyn StateStore>,
    lock_ttl: Duration,
}

impl TaskQueueManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            lock_ttl: Duration::minutes(DEFAULT_LOCK_TTL_MINUTES),
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Claims a task for an agent as a single transaction: validates
    /// `pending`, checks zone access and lock availability for every file
    /// under `conflictStrategy = lock`, acquires all locks atomically (or
    /// releases any partial acquisition on failure), then transitions the
    /// task to `claimed`.
    pub async fn claim_task(
        &self,
        task_id: &str,
        agent_id: &str,
        conflict_strategy: ConflictStrategy,
        zones: Option<&ZoneMatcher>,
    ) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "task {task_id} is {:?}, not pending",
                task.status
            )));
        }

        if conflict_strategy == ConflictStrategy::Lock {
            if let Some(zones) = zones {
                for path in &task.files {
                    let decision = zones.check_access(path, agent_id);
                    if !decision.allowed {
                        return Err(CoreError::Conflict(decision.reason));
                    }
                }
            }

            let mut acquired = Vec::new();
            for path in &task.files {
                match self.store.acquire_lock(path, agent_id, self.lock_ttl).await {
                    Ok(lock) => acquired.push(lock),
                    Err(err) => {
                        for lock in &acquired {
                            let _ = self.store.release_lock(&lock.file_path, agent_id).await;
                        }
                        return Err(err);
                    }
                }
            }
        }

        self.store.claim_task(task_id, agent_id).await
    }

    /// Releases every lock an agent holds on a task's files. Called on
    /// completion, failure, or explicit unlock.
    pub async fn release_task_locks(&self, task: &Task, agent_id: &str) -> Result<()> {
        for path in &task.files {
            self.store.release_lock(path, agent_id).await?;
        }
        Ok(())
    }

    /// Periodic sweep (default every 60s) releasing expired locks.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired = self
            .store
            .sweep_expired_locks(chrono::Utc::now())
            .await?;
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::models::{AgentId, DefaultPolicy, ProjectZoneConfig, ZoneDefinition};
    use crate::store::InMemoryStateStore;
    use std::collections::HashMap;

    fn task_with_files(id: &str, files: Vec<&str>) -> Task {
        Task {
            id: id.to_string(),
            project_id: "p1".into(),
            title: "t".into(),
            description: "t".into(),
            status: TaskStatus::Pending,
            priority: crate::models::Priority::Medium,
            assigned_to: None,
            dependencies: vec![],
            files: files.into_iter().map(String::from).collect(),
            tags: vec![],
            metadata: HashMap::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            reassignment_count: 0,
        }
    }

    #[tokio::test]
    async fn claim_acquires_all_files_atomically() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(Arc::new(EventBus::new())));
        store
            .create_task(task_with_files("t1", vec!["a.rs", "b.rs"]))
            .await
            .unwrap();
        let manager = TaskQueueManager::new(store.clone());

        let claimed = manager
            .claim_task("t1", "agent-a", ConflictStrategy::Lock, None)
            .await
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Claimed);

        let locks = store.list_active_locks().await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn claim_fails_and_releases_partial_locks_on_zone_denial() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(Arc::new(EventBus::new())));
        store
            .create_task(task_with_files("t1", vec!["a.rs", "zoned/b.rs"]))
            .await
            .unwrap();
        let manager = TaskQueueManager::new(store.clone());

        let zones = ZoneMatcher::new(&ProjectZoneConfig {
            zones: vec![ZoneDefinition {
                pattern: "zoned/**".to_string(),
                owners: vec!["someone-else".to_string() as AgentId],
                shared: false,
                description: None,
            }],
            default_policy: DefaultPolicy::Allow,
        });

        let result = manager
            .claim_task("t1", "agent-a", ConflictStrategy::Lock, Some(&zones))
            .await;
        assert!(result.is_err());

        let locks = store.list_active_locks().await.unwrap();
        assert!(locks.is_empty());

        let task = store.get_task("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
