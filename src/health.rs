//! Classifies agent liveness from heartbeat age on a periodic scan.
//!
//! Grounded on `monitoring/mod.rs`'s `SystemMonitor::start_monitoring`
//! periodic-loop-with-graceful-shutdown idiom (`tokio::time::interval` +
//! `mpsc` shutdown signal), repurposed from system resource sampling to
//! heartbeat classification.

use crate::bus::{BusEvent, EventBus};
use crate::models::{AgentProfile, AgentStatus};
use crate::store::StateStore;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Offline,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub warning_secs: i64,
    pub critical_secs: i64,
    pub offline_secs: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_secs: 120,
            critical_secs: 300,
            offline_secs: 600,
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.warning_secs < self.critical_secs && self.critical_secs < self.offline_secs) {
            return Err("thresholds must satisfy warning < critical < offline".to_string());
        }
        Ok(())
    }

    /// Classification is monotone non-increasing in `seconds_since_heartbeat`
    /// across healthy/warning/critical/offline.
    pub fn classify(&self, seconds_since_heartbeat: Option<i64>) -> HealthStatus {
        match seconds_since_heartbeat {
            None => HealthStatus::Offline,
            Some(age) if age >= self.offline_secs => HealthStatus::Offline,
            Some(age) if age >= self.critical_secs => HealthStatus::Critical,
            Some(age) if age >= self.warning_secs => HealthStatus::Warning,
            Some(_) => HealthStatus::Healthy,
        }
    }
}

impl From<HealthStatus> for AgentStatus {
    fn from(value: HealthStatus) -> Self {
        match value {
            HealthStatus::Offline => AgentStatus::Offline,
            // Non-offline health transitions do not force an AgentStatus
            // change on their own; idle/working/blocked is owned by task
            // assignment, not health.
            _ => AgentStatus::Idle,
        }
    }
}

pub struct HealthMonitor {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    thresholds: HealthThresholds,
    scan_interval: std::time::Duration,
    last_status: Mutex<std::collections::HashMap<String, HealthStatus>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>, thresholds: HealthThresholds) -> Self {
        Self {
            store,
            bus,
            thresholds,
            scan_interval: std::time::Duration::from_secs(30),
            last_status: Mutex::new(std::collections::HashMap::new()),
            shutdown_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn with_scan_interval(mut self, interval: std::time::Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub async fn start(self: &Arc<Self>, project_id: String) {
        let (tx, mut rx) = mpsc::channel(1);
        *self.shutdown_tx.lock().await = Some(tx);

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.scan_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = monitor.scan_once(&project_id).await {
                            warn!("health monitor scan failed: {err}");
                        }
                    }
                    _ = rx.recv() => {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn scan_once(&self, project_id: &str) -> crate::error::Result<()> {
        let now = chrono::Utc::now();
        let agents = self.store.list_agents(project_id).await?;
        for agent in agents {
            self.evaluate_agent(&agent, now).await?;
        }
        Ok(())
    }

    async fn evaluate_agent(&self, agent: &AgentProfile, now: chrono::DateTime<chrono::Utc>) -> crate::error::Result<()> {
        let age = agent.seconds_since_heartbeat(now);
        let status = self.thresholds.classify(age);

        let mut last = self.last_status.lock().await;
        let previous = last.get(&agent.id).copied();
        if previous == Some(status) {
            return Ok(());
        }
        last.insert(agent.id.clone(), status);
        drop(last);

        if status == HealthStatus::Offline {
            self.store
                .update_agent_status(&agent.id, AgentStatus::Offline)
                .await?;
        }

        let event = BusEvent::new(format!("status:{status:?}").to_lowercase(), agent.id.clone())
            .with_after(serde_json::json!({
                "agentId": agent.id,
                "previousStatus": previous,
                "currentStatus": format!("{status:?}").to_lowercase(),
            }));
        self.bus.publish(event);

        if matches!(status, HealthStatus::Critical | HealthStatus::Offline) {
            // Best-effort out-of-band alert; failures are swallowed per spec.
            info!("agent {} transitioned to {:?}; alert suppressed in core", agent.id, status);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_is_monotone() {
        let thresholds = HealthThresholds::default();
        assert_eq!(thresholds.classify(Some(0)), HealthStatus::Healthy);
        assert_eq!(thresholds.classify(Some(150)), HealthStatus::Warning);
        assert_eq!(thresholds.classify(Some(301)), HealthStatus::Critical);
        assert_eq!(thresholds.classify(Some(601)), HealthStatus::Offline);
        assert_eq!(thresholds.classify(None), HealthStatus::Offline);
    }

    #[test]
    fn invalid_threshold_ordering_is_rejected() {
        let thresholds = HealthThresholds {
            warning_secs: 300,
            critical_secs: 120,
            offline_secs: 600,
        };
        assert!(thresholds.validate().is_err());
    }
}
