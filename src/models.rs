use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub type AgentId = String;
pub type TaskId = String;
pub type ProjectId = String;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    Lock,
    Merge,
    Zone,
    Review,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyLevel {
    FullAuto,
    Supervised,
    Assisted,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub total: f64,
    pub alert_threshold_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub conflict_strategy: ConflictStrategy,
    pub budget: Option<Budget>,
    pub autonomy_level: AutonomyLevel,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentProvider {
    Anthropic,
    Google,
    Openai,
    Meta,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostPerToken {
    pub input: f64,
    pub output: f64,
}

/// A registered coding agent and its pricing, capability, and liveness state.
///
/// Created on registration; `status` and `last_heartbeat` mutate in place.
/// The profile is destroyed only on explicit removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    pub provider: AgentProvider,
    pub model: String,
    pub capabilities: HashSet<String>,
    pub cost_per_token: CostPerToken,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentProfile {
    pub fn estimated_cost_per_token(&self) -> f64 {
        self.cost_per_token.input + self.cost_per_token.output
    }

    pub fn seconds_since_heartbeat(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_heartbeat
            .map(|hb| (now - hb).num_seconds().max(0))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// A unit of work routed to a single agent at a time.
///
/// Life cycle: `pending -> claimed -> in_progress -> completed | failed`,
/// with `in_progress <-> blocked` looping until resolved. Invariant:
/// `assigned_to` is set iff `status` is one of claimed/in_progress/blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assigned_to: Option<AgentId>,
    pub dependencies: Vec<TaskId>,
    pub files: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reassignment_count: u32,
}

impl Task {
    pub fn invariant_holds(&self) -> bool {
        let should_be_assigned = matches!(
            self.status,
            TaskStatus::Claimed | TaskStatus::InProgress | TaskStatus::Blocked
        );
        self.assigned_to.is_some() == should_be_assigned
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub file_path: String,
    pub agent_id: AgentId,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneDefinition {
    pub pattern: String,
    pub owners: Vec<AgentId>,
    pub shared: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectZoneConfig {
    pub zones: Vec<ZoneDefinition>,
    pub default_policy: DefaultPolicy,
}

/// Append-only token-spend record. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    pub id: String,
    pub project_id: ProjectId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub model: String,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionKind {
    Error {
        severity: ErrorSeverity,
        message: String,
    },
    TestFailure {
        failed_tests: u32,
        output: String,
    },
    AuthRequired {
        provider: String,
        auth_url: String,
    },
    Stuck {
        silent_duration_ms: u64,
    },
    Crash {
        exit_code: i32,
    },
}

/// Stable short name for a detection kind, shared by the decision engine's
/// per-event-type metrics and the sandbox manager's `detection:<kind>` bus
/// events so the two stay in lockstep.
pub fn detection_kind_name(kind: &DetectionKind) -> &'static str {
    match kind {
        DetectionKind::Error { .. } => "error",
        DetectionKind::TestFailure { .. } => "test_failure",
        DetectionKind::AuthRequired { .. } => "auth_required",
        DetectionKind::Stuck { .. } => "stuck",
        DetectionKind::Crash { .. } => "crash",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub agent_id: AgentId,
    pub sandbox_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DetectionKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Autonomous,
    Escalate,
    Ignore,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    PromptAgent,
    RetryTask,
    RestartAgent,
    ReassignTask,
    CleanupLocks,
    ForceReleaseLock,
}

impl ActionType {
    /// Critical actions require approval even under `full_auto`; routine
    /// actions follow the per-autonomy-level allowance table.
    pub fn is_critical(self) -> bool {
        matches!(self, ActionType::RestartAgent)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub trigger_event: DetectionEvent,
    pub action: DecisionAction,
    pub action_type: Option<ActionType>,
    pub priority: Option<EscalationPriority>,
    pub autonomy_level: AutonomyLevel,
    pub created_at: DateTime<Utc>,
    pub status: DecisionStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: String,
    pub project_id: ProjectId,
    pub action: ActionType,
    pub trigger_event: DetectionEvent,
    pub outcome: ActionOutcome,
    pub outcome_details: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationType {
    AuthRequired,
    MergeConflict,
    TaskReview,
    AgentError,
    BudgetExceeded,
    ManualIntervention,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl EscalationPriority {
    pub fn for_type(escalation_type: EscalationType) -> Self {
        match escalation_type {
            EscalationType::AuthRequired => EscalationPriority::Critical,
            EscalationType::MergeConflict | EscalationType::BudgetExceeded => {
                EscalationPriority::High
            }
            _ => EscalationPriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
    Snoozed,
    Resolved,
    Dismissed,
    Escalated,
}

/// A persistent record of a decision requiring a human. Sorted for listing
/// by priority descending, then `created_at` ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: String,
    pub project_id: ProjectId,
    #[serde(rename = "type")]
    pub escalation_type: EscalationType,
    pub priority: EscalationPriority,
    pub status: EscalationStatus,
    pub title: String,
    pub context: HashMap<String, serde_json::Value>,
    pub agent_id: Option<AgentId>,
    pub assigned_to: Option<String>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub id: String,
    pub agent_id: AgentId,
    pub project_id: ProjectId,
    pub status: SandboxStatus,
    pub template: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Extracts the union of `requires:<cap>` tag suffixes plus any string list
/// under `metadata.requiredCapabilities`. Non-list metadata is ignored
/// rather than treated as an error.
pub fn extract_required_capabilities(
    tags: &[String],
    metadata: Option<&HashMap<String, serde_json::Value>>,
) -> HashSet<String> {
    let mut required: HashSet<String> = tags
        .iter()
        .filter_map(|tag| tag.strip_prefix("requires:"))
        .map(|cap| cap.to_string())
        .collect();

    if let Some(metadata) = metadata {
        if let Some(serde_json::Value::Array(values)) = metadata.get("requiredCapabilities") {
            for value in values {
                if let serde_json::Value::String(cap) = value {
                    required.insert(cap.clone());
                }
            }
        }
    }

    required
}
