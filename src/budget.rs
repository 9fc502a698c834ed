//! Append-only cost ledger with a single-crossing budget alert.
//!
//! Grounded on `store/mod.rs`'s `append_cost_event`/`list_cost_events` for
//! persistence; the threshold-crossing guard below is the same
//! compare-before-and-after-the-mutation idiom the state store uses to
//! decide `claim_task` transitions, applied to a running sum instead of an
//! enum state.

use crate::constants::COST_SUMMARY_WINDOW_DAYS;
use crate::error::Result;
use crate::escalation::EscalationQueue;
use crate::models::{CostEvent, EscalationType};
use crate::store::StateStore;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-agent totals for `GET /costs`'s `byAgent` view.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AgentSpend {
    pub agent_id: String,
    pub cost: f64,
}

/// A single day's total spend for the `dailySpend` (last 7 days) view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DailySpend {
    pub date: chrono::NaiveDate,
    pub cost: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CostSummary {
    pub events: Vec<CostEvent>,
    pub total_spend: f64,
    pub budget_total: Option<f64>,
    pub percent_used: Option<f64>,
    pub by_agent: Vec<AgentSpend>,
    pub daily_spend: Vec<DailySpend>,
}

/// Tracks, per project, whether the alert threshold has already been
/// crossed so a sustained-over-budget project raises exactly one
/// `budget_exceeded` escalation rather than one per subsequent cost event.
pub struct BudgetLedger {
    store: Arc<dyn StateStore>,
    escalations: Arc<EscalationQueue>,
    alerted_projects: Mutex<HashSet<String>>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn StateStore>, escalations: Arc<EscalationQueue>) -> Self {
        Self {
            store,
            escalations,
            alerted_projects: Mutex::new(HashSet::new()),
        }
    }

    /// Records a cost event and, if it crosses the project's alert
    /// threshold for the first time, raises a `budget_exceeded` escalation.
    pub async fn record(&self, event: CostEvent) -> Result<()> {
        let project_id = event.project_id.clone();
        let cost = event.cost;
        let before = self.total_spend(&project_id).await?;
        self.store.append_cost_event(event).await?;
        let after = before + cost;

        let project = match self.store.get_project(&project_id).await {
            Ok(project) => project,
            Err(_) => return Ok(()),
        };
        let Some(budget) = project.budget else {
            return Ok(());
        };
        if budget.total <= 0.0 {
            return Ok(());
        }

        let threshold = budget.alert_threshold_pct / 100.0 * budget.total;
        let crossed = before < threshold && after >= threshold;
        if !crossed {
            return Ok(());
        }

        let mut alerted = self.alerted_projects.lock().await;
        if alerted.contains(&project_id) {
            return Ok(());
        }
        alerted.insert(project_id.clone());
        drop(alerted);

        let mut context = HashMap::new();
        context.insert("total_spend".to_string(), serde_json::json!(after));
        context.insert("budget_total".to_string(), serde_json::json!(budget.total));
        context.insert(
            "alert_threshold_pct".to_string(),
            serde_json::json!(budget.alert_threshold_pct),
        );
        self.escalations
            .create(
                &project_id,
                EscalationType::BudgetExceeded,
                format!(
                    "project {project_id} spend ${after:.2} crossed {}% of ${:.2} budget",
                    budget.alert_threshold_pct, budget.total
                ),
                context,
                None,
            )
            .await?;

        Ok(())
    }

    /// Recomputes total spend directly from the ledger rather than trusting
    /// a cached running total, so restarts and concurrent writers stay
    /// consistent with the persisted event list.
    pub async fn total_spend(&self, project_id: &str) -> Result<f64> {
        Ok(self
            .store
            .list_cost_events(project_id)
            .await?
            .iter()
            .map(|event| event.cost)
            .sum())
    }

    pub async fn percent_used(&self, project_id: &str) -> Result<Option<f64>> {
        let project = self.store.get_project(project_id).await?;
        let Some(budget) = project.budget else {
            return Ok(None);
        };
        if budget.total <= 0.0 {
            return Ok(Some(0.0));
        }
        let spend = self.total_spend(project_id).await?;
        Ok(Some((spend / budget.total * 100.0).clamp(0.0, 100.0)))
    }

    pub async fn summary(&self, project_id: &str) -> Result<CostSummary> {
        let events = self.store.list_cost_events(project_id).await?;
        let total_spend = events.iter().map(|event| event.cost).sum();

        let project = self.store.get_project(project_id).await.ok();
        let budget_total = project.as_ref().and_then(|p| p.budget.as_ref()).map(|b| b.total);
        let percent_used = self.percent_used(project_id).await.unwrap_or(None);

        let mut by_agent_totals: HashMap<String, f64> = HashMap::new();
        for event in &events {
            *by_agent_totals.entry(event.agent_id.clone()).or_default() += event.cost;
        }
        let mut by_agent: Vec<AgentSpend> = by_agent_totals
            .into_iter()
            .map(|(agent_id, cost)| AgentSpend { agent_id, cost })
            .collect();
        by_agent.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let cutoff = Utc::now() - Duration::days(COST_SUMMARY_WINDOW_DAYS);
        let mut daily_totals: HashMap<chrono::NaiveDate, f64> = HashMap::new();
        for event in &events {
            if event.created_at < cutoff {
                continue;
            }
            *daily_totals.entry(event.created_at.date_naive()).or_default() += event.cost;
        }
        let mut daily_spend: Vec<DailySpend> = daily_totals
            .into_iter()
            .map(|(date, cost)| DailySpend { date, cost })
            .collect();
        daily_spend.sort_by_key(|entry| entry.date);

        Ok(CostSummary {
            events,
            total_spend,
            budget_total,
            percent_used,
            by_agent,
            daily_spend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::models::{AutonomyLevel, Budget, ConflictStrategy, EscalationStatus, Project};
    use crate::store::InMemoryStateStore;

    fn ledger() -> (BudgetLedger, Arc<dyn StateStore>) {
        let bus = Arc::new(EventBus::new());
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(bus));
        let escalations = Arc::new(EscalationQueue::new(store.clone()));
        (BudgetLedger::new(store.clone(), escalations), store)
    }

    fn project_with_budget(id: &str, total: f64, alert_pct: f64) -> Project {
        Project {
            id: id.to_string(),
            name: "p".into(),
            conflict_strategy: ConflictStrategy::Lock,
            budget: Some(Budget {
                total,
                alert_threshold_pct: alert_pct,
            }),
            autonomy_level: AutonomyLevel::Supervised,
            created_at: Utc::now(),
        }
    }

    fn cost_event(project_id: &str, cost: f64) -> CostEvent {
        CostEvent {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            agent_id: "a1".into(),
            task_id: "t1".into(),
            model: "m".into(),
            tokens_input: 100,
            tokens_output: 100,
            cost,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn crossing_alert_threshold_emits_exactly_one_budget_exceeded_escalation() {
        let (ledger, store) = ledger();
        store
            .create_project(project_with_budget("p1", 100.0, 80.0))
            .await
            .unwrap();

        ledger.record(cost_event("p1", 79.00)).await.unwrap();
        ledger.record(cost_event("p1", 1.01)).await.unwrap();
        ledger.record(cost_event("p1", 1.00)).await.unwrap();

        let escalations = store.list_escalations("p1").await.unwrap();
        let budget_escalations: Vec<_> = escalations
            .iter()
            .filter(|e| e.escalation_type == EscalationType::BudgetExceeded)
            .collect();
        assert_eq!(budget_escalations.len(), 1);
        assert_eq!(budget_escalations[0].priority, crate::models::EscalationPriority::High);
        assert_eq!(budget_escalations[0].status, EscalationStatus::Pending);
    }

    #[tokio::test]
    async fn total_spend_sums_all_events_for_project() {
        let (ledger, store) = ledger();
        store
            .create_project(project_with_budget("p1", 100.0, 80.0))
            .await
            .unwrap();
        ledger.record(cost_event("p1", 10.0)).await.unwrap();
        ledger.record(cost_event("p1", 5.5)).await.unwrap();

        assert_eq!(ledger.total_spend("p1").await.unwrap(), 15.5);
    }

    #[tokio::test]
    async fn percent_used_is_clamped_to_100() {
        let (ledger, store) = ledger();
        store
            .create_project(project_with_budget("p1", 100.0, 80.0))
            .await
            .unwrap();
        ledger.record(cost_event("p1", 250.0)).await.unwrap();

        assert_eq!(ledger.percent_used("p1").await.unwrap(), Some(100.0));
    }

    #[tokio::test]
    async fn project_without_budget_never_raises_an_escalation() {
        let (ledger, store) = ledger();
        store
            .create_project(Project {
                id: "p1".into(),
                name: "p".into(),
                conflict_strategy: ConflictStrategy::Lock,
                budget: None,
                autonomy_level: AutonomyLevel::Supervised,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        ledger.record(cost_event("p1", 1_000_000.0)).await.unwrap();
        assert!(store.list_escalations("p1").await.unwrap().is_empty());
    }
}
