//! Bounded pool of ephemeral execution sandboxes behind a pluggable backend.
//!
//! Generalizes `ClaudeCodeCliClient`'s per-session workspace lifecycle
//! (`get_or_create_session_workspace`, `cleanup_old_workspaces`) and the
//! circuit breaker's retry discipline into a backend-agnostic manager: a cap
//! on concurrent instances, one retry on transient create failures, an
//! auto-kill timer per instance, and a periodic health check.

pub mod local;

use crate::bus::{BusEvent, EventBus};
use crate::error::{CoreError, Result};
use crate::models::{AgentId, ProjectId, SandboxInstance, SandboxStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SANDBOX_LIFETIME_SECS: u64 = 300;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub template: String,
    pub agent_id: AgentId,
    pub project_id: ProjectId,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub cwd: Option<String>,
    pub timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub type OutputSink = Box<dyn Fn(&str) + Send + Sync>;

/// Abstracts a remote or local sandbox provider. Implementations own their
/// own notion of "instance" identity via `SandboxInstance::id`.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn create(&self, options: &CreateOptions) -> Result<SandboxInstance>;
    async fn run(&self, sandbox: &SandboxInstance, command: &str, options: &RunOptions) -> Result<RunResult>;
    async fn run_streaming(
        &self,
        sandbox: &SandboxInstance,
        command: &str,
        options: &RunOptions,
        on_stdout: OutputSink,
        on_stderr: OutputSink,
    ) -> Result<RunResult>;
    async fn read_file(&self, sandbox: &SandboxInstance, path: &str) -> Result<Vec<u8>>;
    async fn write_file(&self, sandbox: &SandboxInstance, path: &str, content: &[u8]) -> Result<()>;
    async fn remove_file(&self, sandbox: &SandboxInstance, path: &str) -> Result<()>;
    async fn list_files(&self, sandbox: &SandboxInstance, path: &str) -> Result<Vec<String>>;
    async fn kill(&self, sandbox: &SandboxInstance) -> Result<()>;
}

struct Instances {
    by_id: HashMap<String, SandboxInstance>,
    kill_timers: HashMap<String, JoinHandle<()>>,
}

/// Owns the sandbox pool: enforces `max_concurrent`, retries `create` once,
/// arms an auto-kill timer per instance, and can run a background health
/// check loop (`start_health_monitor`/`shutdown`) mirroring the health
/// monitor's ticker-with-shutdown-signal idiom.
pub struct SandboxManager {
    backend: Arc<dyn SandboxBackend>,
    bus: Arc<EventBus>,
    max_concurrent: usize,
    instances: Mutex<Instances>,
    health_shutdown: Mutex<Option<mpsc::Sender<()>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxManager {
    pub fn new(backend: Arc<dyn SandboxBackend>, bus: Arc<EventBus>, max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            backend,
            bus,
            max_concurrent,
            instances: Mutex::new(Instances {
                by_id: HashMap::new(),
                kill_timers: HashMap::new(),
            }),
            health_shutdown: Mutex::new(None),
            health_handle: Mutex::new(None),
        })
    }

    async fn active_count(&self) -> usize {
        self.instances
            .lock()
            .await
            .by_id
            .values()
            .filter(|instance| matches!(instance.status, SandboxStatus::Pending | SandboxStatus::Running))
            .count()
    }

    pub async fn create(self: &Arc<Self>, options: CreateOptions) -> Result<SandboxInstance> {
        if self.active_count().await >= self.max_concurrent {
            return Err(CoreError::Capacity(format!(
                "sandbox pool at capacity ({} active)",
                self.max_concurrent
            )));
        }

        let instance = match self.backend.create(&options).await {
            Ok(instance) => instance,
            Err(CoreError::Transient(reason)) => {
                warn!("sandbox create failed transiently ({reason}), retrying once after 2s");
                tokio::time::sleep(Duration::from_secs(2)).await;
                self.backend.create(&options).await?
            }
            Err(err) => return Err(err),
        };

        self.instances
            .lock()
            .await
            .by_id
            .insert(instance.id.clone(), instance.clone());

        self.bus.publish(
            BusEvent::new("sandbox:started", instance.id.clone()).with_project(instance.project_id.clone()),
        );

        self.arm_auto_kill(instance.id.clone(), Duration::from_secs(options.timeout_secs))
            .await;

        Ok(instance)
    }

    async fn arm_auto_kill(self: &Arc<Self>, sandbox_id: String, lifetime: Duration) {
        let manager = self.clone();
        let timer_id = sandbox_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            manager.on_timeout(&timer_id).await;
        });
        self.instances
            .lock()
            .await
            .kill_timers
            .insert(sandbox_id, handle);
    }

    async fn on_timeout(self: &Arc<Self>, sandbox_id: &str) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.by_id.get_mut(sandbox_id) {
            if matches!(instance.status, SandboxStatus::Pending | SandboxStatus::Running) {
                instance.status = SandboxStatus::Timeout;
                let instance = instance.clone();
                instances.kill_timers.remove(sandbox_id);
                drop(instances);
                let _ = self.backend.kill(&instance).await;
                self.bus.publish(
                    BusEvent::new("sandbox:timeout", instance.id.clone())
                        .with_project(instance.project_id.clone()),
                );
                return;
            }
        }
    }

    pub async fn kill(&self, sandbox_id: &str) -> Result<()> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .by_id
            .get_mut(sandbox_id)
            .ok_or_else(|| CoreError::NotFound(format!("sandbox {sandbox_id}")))?;
        instance.status = SandboxStatus::Stopped;
        let instance = instance.clone();
        if let Some(handle) = instances.kill_timers.remove(sandbox_id) {
            handle.abort();
        }
        drop(instances);

        self.backend.kill(&instance).await?;
        self.bus.publish(
            BusEvent::new("sandbox:stopped", instance.id.clone()).with_project(instance.project_id.clone()),
        );
        Ok(())
    }

    pub async fn run(&self, sandbox_id: &str, command: &str, options: &RunOptions) -> Result<RunResult> {
        let instance = self.get(sandbox_id).await?;
        let result = self.backend.run(&instance, command, options).await?;
        self.touch_activity(sandbox_id).await;
        Ok(result)
    }

    /// Streams a command's stdout/stderr in arrival order, updating
    /// `lastActivityAt` on every chunk and, when `detectors` is supplied,
    /// feeding each line into the pattern-detector pipeline and publishing
    /// any resulting `DetectionEvent` as a `detection:<kind>` bus event for
    /// the decision engine to pick up.
    pub async fn run_streaming(
        self: &Arc<Self>,
        sandbox_id: &str,
        agent_id: &str,
        command: &str,
        options: &RunOptions,
        detectors: Option<Arc<crate::detectors::PatternMatcher>>,
        on_stdout: OutputSink,
        on_stderr: OutputSink,
    ) -> Result<RunResult> {
        let instance = self.get(sandbox_id).await?;

        let wrapped_stdout = self.wrap_chunk_sink(sandbox_id, agent_id, detectors.clone(), on_stdout);
        let wrapped_stderr = self.wrap_chunk_sink(sandbox_id, agent_id, detectors, on_stderr);

        let result = self
            .backend
            .run_streaming(&instance, command, options, wrapped_stdout, wrapped_stderr)
            .await?;
        self.touch_activity(sandbox_id).await;
        Ok(result)
    }

    /// Wraps a caller-supplied chunk sink so every chunk also refreshes the
    /// sandbox's activity timestamp and, if wired, runs through the pattern
    /// detectors. The sink itself must stay synchronous (it is invoked
    /// inline from the backend's line-reading loop), so the async follow-up
    /// work is handed to its own task.
    fn wrap_chunk_sink(
        self: &Arc<Self>,
        sandbox_id: &str,
        agent_id: &str,
        detectors: Option<Arc<crate::detectors::PatternMatcher>>,
        inner: OutputSink,
    ) -> OutputSink {
        let manager = self.clone();
        let sandbox_id = sandbox_id.to_string();
        let agent_id = agent_id.to_string();
        Box::new(move |line: &str| {
            inner(line);
            let manager = manager.clone();
            let sandbox_id = sandbox_id.clone();
            let agent_id = agent_id.clone();
            let detectors = detectors.clone();
            let line = line.to_string();
            tokio::spawn(async move {
                manager.touch_activity(&sandbox_id).await;
                if let Some(detectors) = detectors {
                    if let Some(event) = detectors.feed_line(&agent_id, &sandbox_id, &line) {
                        let kind = crate::models::detection_kind_name(&event.kind);
                        manager.bus.publish(
                            BusEvent::new(format!("detection:{kind}"), agent_id.clone())
                                .with_after(serde_json::to_value(&event).unwrap_or_default()),
                        );
                    }
                }
            });
        })
    }

    async fn get(&self, sandbox_id: &str) -> Result<SandboxInstance> {
        self.instances
            .lock()
            .await
            .by_id
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("sandbox {sandbox_id}")))
    }

    async fn touch_activity(&self, sandbox_id: &str) {
        if let Some(instance) = self.instances.lock().await.by_id.get_mut(sandbox_id) {
            instance.last_activity_at = Utc::now();
        }
    }

    /// Stops every `running` sandbox whose age exceeds `max_age`, returning
    /// the set of ids stopped.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let stale_ids: Vec<String> = {
            let instances = self.instances.lock().await;
            instances
                .by_id
                .values()
                .filter(|instance| instance.status == SandboxStatus::Running)
                .filter(|instance| {
                    (now - instance.started_at)
                        .to_std()
                        .map(|age| age > max_age)
                        .unwrap_or(false)
                })
                .map(|instance| instance.id.clone())
                .collect()
        };

        for id in &stale_ids {
            if let Err(err) = self.kill(id).await {
                warn!("cleanup_stale: failed to kill sandbox {id}: {err}");
            }
        }

        Ok(stale_ids)
    }

    /// Starts a periodic `echo ok` health check against every running
    /// sandbox; a failing or erroring check flips status to `failed`.
    pub async fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        let (tx, mut rx) = mpsc::channel(1);
        *self.health_shutdown.lock().await = Some(tx);

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.health_check_once().await,
                    _ = rx.recv() => {
                        info!("sandbox health monitor shutting down");
                        break;
                    }
                }
            }
        });
        *self.health_handle.lock().await = Some(handle);
    }

    async fn health_check_once(&self) {
        let running: Vec<SandboxInstance> = self
            .instances
            .lock()
            .await
            .by_id
            .values()
            .filter(|instance| instance.status == SandboxStatus::Running)
            .cloned()
            .collect();

        for instance in running {
            let options = RunOptions::default();
            let healthy = matches!(
                self.backend.run(&instance, "echo ok", &options).await,
                Ok(result) if result.exit_code == 0
            );
            if !healthy {
                if let Some(entry) = self.instances.lock().await.by_id.get_mut(&instance.id) {
                    entry.status = SandboxStatus::Failed;
                }
                self.bus.publish(
                    BusEvent::new("sandbox:failed", instance.id.clone())
                        .with_project(instance.project_id.clone()),
                );
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.health_shutdown.lock().await.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.health_handle.lock().await.take() {
            let _ = handle.await;
        }
        let mut instances = self.instances.lock().await;
        for (_, handle) in instances.kill_timers.drain() {
            handle.abort();
        }
    }
}
