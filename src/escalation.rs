//! Prioritized, durable queue for decisions that require a human.
//!
//! Grounded on `store/mod.rs`'s escalation CRUD (`create_escalation`,
//! `update_escalation`, `list_escalations`) for persistence and on
//! `decision.rs`'s `MetricsTracker` for the counts view; this module adds the
//! workflow (acknowledge/snooze/resolve/dismiss/escalate) and derived
//! notify/due predicates on top.

use crate::error::Result;
use crate::models::{
    DecisionAction, DetectionEvent, DetectionKind, Escalation, EscalationPriority, EscalationStatus,
    EscalationType,
};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Summary counts for the `GET /project` and `GET /costs`-adjacent views.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EscalationCounts {
    pub total: usize,
    pub pending: usize,
    pub acknowledged: usize,
    pub snoozed: usize,
    pub resolved: usize,
    pub dismissed: usize,
    pub escalated: usize,
    pub critical: usize,
}

pub struct EscalationQueue {
    store: Arc<dyn StateStore>,
}

impl EscalationQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Infers the escalation type from a detection event's kind, per §3's
    /// automatic-priority table (auth_required maps to itself; everything
    /// else this path can see maps to agent_error or task_review).
    fn infer_type(kind: &DetectionKind) -> EscalationType {
        match kind {
            DetectionKind::AuthRequired { .. } => EscalationType::AuthRequired,
            DetectionKind::TestFailure { .. } => EscalationType::TaskReview,
            DetectionKind::Error { .. } | DetectionKind::Crash { .. } | DetectionKind::Stuck { .. } => {
                EscalationType::AgentError
            }
        }
    }

    fn title_for(kind: &DetectionKind, agent_id: &str) -> String {
        match kind {
            DetectionKind::Error { severity, .. } => format!("{agent_id}: {severity:?} error detected"),
            DetectionKind::TestFailure { failed_tests, .. } => {
                format!("{agent_id}: {failed_tests} test(s) failing")
            }
            DetectionKind::AuthRequired { provider, .. } => {
                format!("{agent_id}: {provider} authentication required")
            }
            DetectionKind::Stuck { .. } => format!("{agent_id}: no activity, appears stuck"),
            DetectionKind::Crash { exit_code } => format!("{agent_id}: sandbox exited ({exit_code})"),
        }
    }

    /// Creates an escalation from a detection event and the decision that
    /// routed it here, capturing the triggering console output in context.
    /// Only sensible when `decision.action == DecisionAction::Escalate`.
    pub async fn create_from_detection(
        &self,
        project_id: &str,
        event: &DetectionEvent,
        decision_action: DecisionAction,
        console_output: &[String],
    ) -> Result<Escalation> {
        let escalation_type = Self::infer_type(&event.kind);
        let mut context = HashMap::new();
        context.insert("detection".to_string(), serde_json::to_value(event)?);
        context.insert(
            "decision_action".to_string(),
            serde_json::to_value(decision_action)?,
        );
        context.insert(
            "console_output".to_string(),
            serde_json::Value::Array(
                console_output
                    .iter()
                    .map(|line| serde_json::Value::String(line.clone()))
                    .collect(),
            ),
        );

        self.create(
            project_id,
            escalation_type,
            Self::title_for(&event.kind, &event.agent_id),
            context,
            Some(event.agent_id.clone()),
        )
        .await
    }

    /// Low-level constructor used by callers outside the detection pipeline
    /// (budget alerts, merge conflicts) that already know their type.
    pub async fn create(
        &self,
        project_id: &str,
        escalation_type: EscalationType,
        title: String,
        context: HashMap<String, serde_json::Value>,
        agent_id: Option<String>,
    ) -> Result<Escalation> {
        let escalation = Escalation {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            escalation_type,
            priority: EscalationPriority::for_type(escalation_type),
            status: EscalationStatus::Pending,
            title,
            context,
            agent_id,
            assigned_to: None,
            resolved_by: None,
            resolution: None,
            snoozed_until: None,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.store.create_escalation(escalation.clone()).await?;
        Ok(escalation)
    }

    pub async fn acknowledge(&self, id: &str, user_id: &str) -> Result<Escalation> {
        let mut escalation = self.store.get_escalation(id).await?;
        escalation.status = EscalationStatus::Acknowledged;
        escalation.assigned_to = Some(user_id.to_string());
        self.store.update_escalation(escalation.clone()).await?;
        Ok(escalation)
    }

    pub async fn snooze(&self, id: &str, until: DateTime<Utc>) -> Result<Escalation> {
        let mut escalation = self.store.get_escalation(id).await?;
        escalation.status = EscalationStatus::Snoozed;
        escalation.snoozed_until = Some(until);
        self.store.update_escalation(escalation.clone()).await?;
        Ok(escalation)
    }

    pub async fn resolve(&self, id: &str, user_id: &str, resolution: &str) -> Result<Escalation> {
        let mut escalation = self.store.get_escalation(id).await?;
        escalation.status = EscalationStatus::Resolved;
        escalation.resolved_by = Some(user_id.to_string());
        escalation.resolution = Some(resolution.to_string());
        escalation.resolved_at = Some(Utc::now());
        self.store.update_escalation(escalation.clone()).await?;
        Ok(escalation)
    }

    pub async fn dismiss(&self, id: &str) -> Result<Escalation> {
        let mut escalation = self.store.get_escalation(id).await?;
        escalation.status = EscalationStatus::Dismissed;
        escalation.resolved_at = Some(Utc::now());
        self.store.update_escalation(escalation.clone()).await?;
        Ok(escalation)
    }

    /// Marks an escalation as handed off to an external system/person beyond
    /// the usual in-app acknowledge/resolve flow.
    pub async fn escalate_external(&self, id: &str, user_id: &str) -> Result<Escalation> {
        let mut escalation = self.store.get_escalation(id).await?;
        escalation.status = EscalationStatus::Escalated;
        escalation.assigned_to = Some(user_id.to_string());
        self.store.update_escalation(escalation.clone()).await?;
        Ok(escalation)
    }

    fn sorted(mut escalations: Vec<Escalation>) -> Vec<Escalation> {
        escalations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        escalations
    }

    pub async fn get_all(&self, project_id: &str) -> Result<Vec<Escalation>> {
        Ok(Self::sorted(self.store.list_escalations(project_id).await?))
    }

    pub async fn get_pending(&self, project_id: &str) -> Result<Vec<Escalation>> {
        Ok(Self::sorted(
            self.store
                .list_escalations(project_id)
                .await?
                .into_iter()
                .filter(|e| e.status == EscalationStatus::Pending)
                .collect(),
        ))
    }

    pub async fn get_critical(&self, project_id: &str) -> Result<Vec<Escalation>> {
        Ok(Self::sorted(
            self.store
                .list_escalations(project_id)
                .await?
                .into_iter()
                .filter(|e| e.priority == EscalationPriority::Critical)
                .collect(),
        ))
    }

    pub async fn get_counts(&self, project_id: &str) -> Result<EscalationCounts> {
        let escalations = self.store.list_escalations(project_id).await?;
        let mut counts = EscalationCounts {
            total: escalations.len(),
            ..Default::default()
        };
        for escalation in &escalations {
            match escalation.status {
                EscalationStatus::Pending => counts.pending += 1,
                EscalationStatus::Acknowledged => counts.acknowledged += 1,
                EscalationStatus::Snoozed => counts.snoozed += 1,
                EscalationStatus::Resolved => counts.resolved += 1,
                EscalationStatus::Dismissed => counts.dismissed += 1,
                EscalationStatus::Escalated => counts.escalated += 1,
            }
            if escalation.priority == EscalationPriority::Critical {
                counts.critical += 1;
            }
        }
        Ok(counts)
    }

    /// True iff `priority = critical`, or `priority = high ∧ assignedTo ≠ ⊥`.
    pub fn should_notify(escalation: &Escalation) -> bool {
        escalation.priority == EscalationPriority::Critical
            || (escalation.priority == EscalationPriority::High && escalation.assigned_to.is_some())
    }

    /// True unless the escalation is snoozed with a not-yet-elapsed deadline.
    pub fn is_due(escalation: &Escalation, now: DateTime<Utc>) -> bool {
        if escalation.status != EscalationStatus::Snoozed {
            return true;
        }
        match escalation.snoozed_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::models::ErrorSeverity;
    use crate::store::InMemoryStateStore;
    use chrono::Duration;

    fn queue() -> EscalationQueue {
        let bus = Arc::new(EventBus::new());
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(bus));
        EscalationQueue::new(store)
    }

    fn detection(kind: DetectionKind) -> DetectionEvent {
        DetectionEvent {
            agent_id: "a1".into(),
            sandbox_id: "sb1".into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    #[tokio::test]
    async fn auth_required_detection_creates_critical_escalation() {
        let queue = queue();
        let event = detection(DetectionKind::AuthRequired {
            provider: "github".into(),
            auth_url: "https://github.com/login/oauth/authorize".into(),
        });
        let escalation = queue
            .create_from_detection("p1", &event, DecisionAction::Escalate, &[])
            .await
            .unwrap();
        assert_eq!(escalation.escalation_type, EscalationType::AuthRequired);
        assert_eq!(escalation.priority, EscalationPriority::Critical);
        assert_eq!(escalation.status, EscalationStatus::Pending);
    }

    #[tokio::test]
    async fn fatal_error_creates_agent_error_escalation() {
        let queue = queue();
        let event = detection(DetectionKind::Error {
            severity: ErrorSeverity::Fatal,
            message: "panic".into(),
        });
        let escalation = queue
            .create_from_detection("p1", &event, DecisionAction::Escalate, &["line1".into()])
            .await
            .unwrap();
        assert_eq!(escalation.escalation_type, EscalationType::AgentError);
        assert!(escalation.context.contains_key("console_output"));
    }

    #[tokio::test]
    async fn listing_sorts_by_priority_desc_then_created_at_asc() {
        let queue = queue();
        let low = queue
            .create(
                "p1",
                EscalationType::TaskReview,
                "low".into(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();
        let critical = queue
            .create(
                "p1",
                EscalationType::AuthRequired,
                "critical".into(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();

        let all = queue.get_all("p1").await.unwrap();
        assert_eq!(all[0].id, critical.id);
        assert_eq!(all[1].id, low.id);
    }

    #[tokio::test]
    async fn acknowledge_snooze_resolve_dismiss_transition_status() {
        let queue = queue();
        let escalation = queue
            .create(
                "p1",
                EscalationType::ManualIntervention,
                "t".into(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();

        let acked = queue.acknowledge(&escalation.id, "user1").await.unwrap();
        assert_eq!(acked.status, EscalationStatus::Acknowledged);

        let until = Utc::now() + Duration::hours(1);
        let snoozed = queue.snooze(&escalation.id, until).await.unwrap();
        assert_eq!(snoozed.status, EscalationStatus::Snoozed);
        assert!(!EscalationQueue::is_due(&snoozed, Utc::now()));
        assert!(EscalationQueue::is_due(&snoozed, until + Duration::seconds(1)));

        let resolved = queue.resolve(&escalation.id, "user1", "fixed").await.unwrap();
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert_eq!(resolved.resolution.as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn should_notify_matches_critical_or_assigned_high() {
        let queue = queue();
        let critical = queue
            .create("p1", EscalationType::AuthRequired, "t".into(), HashMap::new(), None)
            .await
            .unwrap();
        assert!(EscalationQueue::should_notify(&critical));

        let unassigned_high = queue
            .create("p1", EscalationType::MergeConflict, "t".into(), HashMap::new(), None)
            .await
            .unwrap();
        assert!(!EscalationQueue::should_notify(&unassigned_high));

        let assigned_high = queue.acknowledge(&unassigned_high.id, "user1").await.unwrap();
        assert!(EscalationQueue::should_notify(&assigned_high));
    }

    #[tokio::test]
    async fn get_counts_tallies_by_status_and_critical_priority() {
        let queue = queue();
        queue
            .create("p1", EscalationType::AuthRequired, "t".into(), HashMap::new(), None)
            .await
            .unwrap();
        let resolved = queue
            .create("p1", EscalationType::TaskReview, "t".into(), HashMap::new(), None)
            .await
            .unwrap();
        queue.resolve(&resolved.id, "user1", "done").await.unwrap();

        let counts = queue.get_counts("p1").await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.resolved, 1);
        assert_eq!(counts.critical, 1);
    }
}
