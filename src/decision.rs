//! Maps a detection event plus per-agent state and project autonomy level to
//! an autonomous action or an escalation, with outcome-tracking metrics.
//!
//! The metrics tracker generalizes the circuit breaker's atomic-counter
//! bookkeeping (`AtomicU32`/`AtomicU64` totals in `claude_code/circuit_breaker.rs`)
//! from per-circuit counters to per-event-type counters.

use crate::models::{
    detection_kind_name as event_type_name, ActionType, AgentId, AutonomyLevel, DecisionAction,
    DecisionStatus, DetectionEvent, DetectionKind, EscalationPriority, TaskId,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub const STUCK_PROMPT_ATTEMPT_LIMIT: u32 = 2;
pub const TEST_FAILURE_RETRY_LIMIT: u32 = 3;
pub const CRASH_RESTART_LIMIT: u32 = 3;
pub const CRASH_BACKOFF_SECS: i64 = 60;

#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub stuck_prompt_attempts: u32,
    pub task_retry_counts: HashMap<TaskId, u32>,
    pub crash_restart_count: u32,
    pub last_crash_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub action: DecisionAction,
    pub action_type: Option<ActionType>,
    pub priority: Option<EscalationPriority>,
    pub status: DecisionStatus,
}

/// Per-`(agentId, taskId?)` outcome counters keyed by event type, exposed via
/// `get_stats`.
#[derive(Default)]
struct EventTypeCounters {
    total: AtomicU64,
    autonomous: AtomicU64,
    escalated: AtomicU64,
    successes: AtomicU64,
    outcomes_recorded: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct EventTypeStats {
    pub total: u64,
    pub autonomous: u64,
    pub escalated: u64,
    pub success_rate: f64,
}

pub struct MetricsTracker {
    counters: Mutex<HashMap<String, EventTypeCounters>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn record_decision(&self, event_type: &str, decision: &Decision) {
        let mut counters = self.counters.lock().expect("metrics lock poisoned");
        let entry = counters.entry(event_type.to_string()).or_default();
        entry.total.fetch_add(1, Ordering::Relaxed);
        match decision.action {
            DecisionAction::Autonomous => {
                entry.autonomous.fetch_add(1, Ordering::Relaxed);
            }
            DecisionAction::Escalate => {
                entry.escalated.fetch_add(1, Ordering::Relaxed);
            }
            DecisionAction::Ignore => {}
        }
    }

    pub fn record_outcome(&self, event_type: &str, success: bool) {
        let mut counters = self.counters.lock().expect("metrics lock poisoned");
        let entry = counters.entry(event_type.to_string()).or_default();
        entry.outcomes_recorded.fetch_add(1, Ordering::Relaxed);
        if success {
            entry.successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_stats(&self, event_type: &str) -> EventTypeStats {
        let counters = self.counters.lock().expect("metrics lock poisoned");
        match counters.get(event_type) {
            Some(entry) => {
                let total = entry.total.load(Ordering::Relaxed);
                let autonomous = entry.autonomous.load(Ordering::Relaxed);
                let escalated = entry.escalated.load(Ordering::Relaxed);
                let outcomes = entry.outcomes_recorded.load(Ordering::Relaxed);
                let successes = entry.successes.load(Ordering::Relaxed);
                let success_rate = if outcomes == 0 {
                    0.0
                } else {
                    successes as f64 / outcomes as f64
                };
                EventTypeStats {
                    total,
                    autonomous,
                    escalated,
                    success_rate,
                }
            }
            None => EventTypeStats {
                total: 0,
                autonomous: 0,
                escalated: 0,
                success_rate: 0.0,
            },
        }
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn routine_action_allowed(level: AutonomyLevel) -> bool {
    matches!(level, AutonomyLevel::FullAuto | AutonomyLevel::Supervised)
}

fn critical_action_allowed(level: AutonomyLevel) -> bool {
    // Critical actions always require approval, even under full_auto; there
    // is no autonomy level under which they execute without one.
    let _ = level;
    false
}

pub struct DecisionEngine {
    pub metrics: MetricsTracker,
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self {
            metrics: MetricsTracker::new(),
        }
    }

    /// Evaluates the ordered rule table in the data model's description,
    /// first match wins, then applies the autonomy-level override.
    pub fn decide(
        &self,
        event: &DetectionEvent,
        state: &mut AgentState,
        triggering_task_id: Option<&TaskId>,
        autonomy_level: AutonomyLevel,
    ) -> Decision {
        let mut decision = self.apply_rules(event, state, triggering_task_id);
        self.apply_autonomy_override(&mut decision, autonomy_level);
        self.metrics.record_decision(event_type_name(&event.kind), &decision);
        decision
    }

    /// Evaluates the rule for this event kind against the *current* counters,
    /// then updates those counters to reflect the attempt just made —
    /// incrementing `stuckPromptAttempts`/retry counts/`crashRestartCount` on
    /// each autonomous attempt so the next event sees the up-to-date count.
    fn apply_rules(
        &self,
        event: &DetectionEvent,
        state: &mut AgentState,
        triggering_task_id: Option<&TaskId>,
    ) -> Decision {
        match &event.kind {
            DetectionKind::AuthRequired { .. } => escalate(EscalationPriority::Critical),
            DetectionKind::Error { severity, .. } => {
                if *severity == crate::models::ErrorSeverity::Fatal {
                    escalate(EscalationPriority::Critical)
                } else {
                    autonomous(ActionType::PromptAgent)
                }
            }
            DetectionKind::TestFailure { .. } => {
                let retries = triggering_task_id
                    .and_then(|task_id| state.task_retry_counts.get(task_id))
                    .copied()
                    .unwrap_or(0);
                if retries < TEST_FAILURE_RETRY_LIMIT {
                    if let Some(task_id) = triggering_task_id {
                        *state.task_retry_counts.entry(task_id.clone()).or_insert(0) += 1;
                    }
                    autonomous(ActionType::RetryTask)
                } else {
                    escalate(EscalationPriority::High)
                }
            }
            DetectionKind::Stuck { .. } => {
                if state.stuck_prompt_attempts < STUCK_PROMPT_ATTEMPT_LIMIT {
                    state.stuck_prompt_attempts += 1;
                    autonomous(ActionType::PromptAgent)
                } else {
                    escalate(EscalationPriority::High)
                }
            }
            DetectionKind::Crash { .. } => {
                let cooled_down = state
                    .last_crash_at
                    .map(|at| (event.timestamp - at).num_seconds() >= CRASH_BACKOFF_SECS)
                    .unwrap_or(true);
                if state.crash_restart_count < CRASH_RESTART_LIMIT && cooled_down {
                    state.crash_restart_count += 1;
                    state.last_crash_at = Some(event.timestamp);
                    autonomous(ActionType::RestartAgent)
                } else {
                    escalate(EscalationPriority::High)
                }
            }
        }
    }

    fn apply_autonomy_override(&self, decision: &mut Decision, level: AutonomyLevel) {
        let Some(action_type) = decision.action_type else {
            return;
        };
        if decision.action != DecisionAction::Autonomous {
            return;
        }

        let allowed = if action_type.is_critical() {
            critical_action_allowed(level)
        } else {
            routine_action_allowed(level)
        };

        if !allowed {
            decision.action = DecisionAction::Escalate;
            decision.priority = Some(EscalationPriority::High);
            decision.action_type = None;
        }
    }

    /// Applies an agent-state transition for a successful autonomous action,
    /// e.g. resetting `stuckPromptAttempts` on observed recovery.
    pub fn record_success(&self, state: &mut AgentState, action_type: ActionType, task_id: Option<&TaskId>) {
        match action_type {
            ActionType::PromptAgent => state.stuck_prompt_attempts = 0,
            ActionType::RetryTask => {
                if let Some(task_id) = task_id {
                    state.task_retry_counts.remove(task_id);
                }
            }
            ActionType::RestartAgent => {
                state.crash_restart_count = 0;
                state.last_crash_at = None;
            }
            _ => {}
        }
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn autonomous(action_type: ActionType) -> Decision {
    Decision {
        action: DecisionAction::Autonomous,
        action_type: Some(action_type),
        priority: None,
        status: DecisionStatus::Pending,
    }
}

fn escalate(priority: EscalationPriority) -> Decision {
    Decision {
        action: DecisionAction::Escalate,
        action_type: None,
        priority: Some(priority),
        status: DecisionStatus::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorSeverity;

    fn event(kind: DetectionKind) -> DetectionEvent {
        DetectionEvent {
            agent_id: "a1".into(),
            sandbox_id: "sb1".into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn fatal_error_always_escalates_critical_regardless_of_autonomy() {
        let engine = DecisionEngine::new();
        let mut state = AgentState::default();
        let decision = engine.decide(
            &event(DetectionKind::Error {
                severity: ErrorSeverity::Fatal,
                message: "disk full".into(),
            }),
            &mut state,
            None,
            AutonomyLevel::FullAuto,
        );
        assert_eq!(decision.action, DecisionAction::Escalate);
        assert_eq!(decision.priority, Some(EscalationPriority::Critical));
    }

    #[test]
    fn non_fatal_error_prompts_agent_under_full_auto() {
        let engine = DecisionEngine::new();
        let mut state = AgentState::default();
        let decision = engine.decide(
            &event(DetectionKind::Error {
                severity: ErrorSeverity::Error,
                message: "connection refused".into(),
            }),
            &mut state,
            None,
            AutonomyLevel::FullAuto,
        );
        assert_eq!(decision.action, DecisionAction::Autonomous);
        assert_eq!(decision.action_type, Some(ActionType::PromptAgent));
    }

    #[test]
    fn routine_action_downgrades_to_escalate_under_manual_autonomy() {
        let engine = DecisionEngine::new();
        let mut state = AgentState::default();
        let decision = engine.decide(
            &event(DetectionKind::Error {
                severity: ErrorSeverity::Error,
                message: "connection refused".into(),
            }),
            &mut state,
            None,
            AutonomyLevel::Manual,
        );
        assert_eq!(decision.action, DecisionAction::Escalate);
    }

    #[test]
    fn stuck_prompts_twice_then_escalates() {
        let engine = DecisionEngine::new();
        let mut state = AgentState::default();

        let first = engine.decide(
            &event(DetectionKind::Stuck { silent_duration_ms: 400_000 }),
            &mut state,
            None,
            AutonomyLevel::FullAuto,
        );
        assert_eq!(first.action, DecisionAction::Autonomous);
        assert_eq!(first.action_type, Some(ActionType::PromptAgent));
        assert_eq!(state.stuck_prompt_attempts, 1);

        let second = engine.decide(
            &event(DetectionKind::Stuck { silent_duration_ms: 400_000 }),
            &mut state,
            None,
            AutonomyLevel::FullAuto,
        );
        assert_eq!(second.action, DecisionAction::Autonomous);
        assert_eq!(second.action_type, Some(ActionType::PromptAgent));
        assert_eq!(state.stuck_prompt_attempts, 2);

        let third = engine.decide(
            &event(DetectionKind::Stuck { silent_duration_ms: 400_000 }),
            &mut state,
            None,
            AutonomyLevel::FullAuto,
        );
        assert_eq!(third.action, DecisionAction::Escalate);
        assert_eq!(third.priority, Some(EscalationPriority::High));
    }

    #[test]
    fn restart_agent_is_critical_and_requires_approval_even_under_full_auto() {
        let engine = DecisionEngine::new();
        let mut state = AgentState::default();
        let decision = engine.decide(
            &event(DetectionKind::Crash { exit_code: 1 }),
            &mut state,
            None,
            AutonomyLevel::FullAuto,
        );
        assert_eq!(decision.action, DecisionAction::Escalate);
    }

    #[test]
    fn test_failure_retries_three_times_then_escalates() {
        let engine = DecisionEngine::new();
        let mut state = AgentState::default();
        let task_id = "task-1".to_string();
        let make_event = || {
            event(DetectionKind::TestFailure {
                failed_tests: 1,
                output: "Tests: 1 failed, 4 passed".into(),
            })
        };

        for expected_retries in 1..=TEST_FAILURE_RETRY_LIMIT {
            let decision = engine.decide(&make_event(), &mut state, Some(&task_id), AutonomyLevel::FullAuto);
            assert_eq!(decision.action, DecisionAction::Autonomous);
            assert_eq!(decision.action_type, Some(ActionType::RetryTask));
            assert_eq!(state.task_retry_counts.get(&task_id), Some(&expected_retries));
        }

        let decision = engine.decide(&make_event(), &mut state, Some(&task_id), AutonomyLevel::FullAuto);
        assert_eq!(decision.action, DecisionAction::Escalate);
        assert_eq!(decision.priority, Some(EscalationPriority::High));
    }

    #[test]
    fn metrics_track_totals_per_event_type() {
        let engine = DecisionEngine::new();
        let mut state = AgentState::default();
        engine.decide(
            &event(DetectionKind::Error {
                severity: ErrorSeverity::Error,
                message: "x".into(),
            }),
            &mut state,
            None,
            AutonomyLevel::Manual,
        );
        let stats = engine.metrics.get_stats("error");
        assert_eq!(stats.total, 1);
        assert_eq!(stats.escalated, 1);
    }
}
