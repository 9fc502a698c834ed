//! Dispatches console output lines through a chain of pattern detectors,
//! each emitting at most one [`DetectionEvent`] per line.
//!
//! Grounded on `validation.rs`'s `TaskContentValidator` (a struct holding
//! pre-compiled `Regex`es, validated once at construction) generalized from
//! content-safety checking to log-line classification.

use crate::models::{AgentId, DetectionEvent, DetectionKind, ErrorSeverity};
use chrono::Utc;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_RING_BUFFER_CAPACITY: usize = 1024;
pub const DEFAULT_STUCK_CHECK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SILENCE_THRESHOLD_MS: u64 = 300_000;

/// Struct-of-compiled-regexes classifying a single line for fatal/error/
/// warning severity, with first-match-wins priority.
struct ErrorDetector {
    fatal: Regex,
    error: Regex,
    warning: Regex,
}

impl ErrorDetector {
    fn new() -> Self {
        Self {
            fatal: Regex::new(r"(?i)\b(FATAL|PANIC|CRITICAL)\b").expect("static pattern"),
            error: Regex::new(
                r"(?i)\bError:|\bException:|\b\w+Error:|\b\w+Exception:|failed.*error|error.*failed",
            )
            .expect("static pattern"),
            warning: Regex::new(r"(?i)\bWarning:|\bWARN\b|\bDeprecated\b").expect("static pattern"),
        }
    }

    fn detect(&self, line: &str) -> Option<DetectionKind> {
        if self.fatal.is_match(line) {
            return Some(DetectionKind::Error {
                severity: ErrorSeverity::Fatal,
                message: line.to_string(),
            });
        }
        if self.error.is_match(line) {
            return Some(DetectionKind::Error {
                severity: ErrorSeverity::Error,
                message: line.to_string(),
            });
        }
        if self.warning.is_match(line) {
            return Some(DetectionKind::Error {
                severity: ErrorSeverity::Warning,
                message: line.to_string(),
            });
        }
        None
    }
}

struct TestFailureDetector {
    pattern: Regex,
}

impl TestFailureDetector {
    fn new() -> Self {
        Self {
            pattern: Regex::new(r"Tests:\s*(\d+)\s*failed(?:,\s*(\d+)\s*passed)?")
                .expect("static pattern"),
        }
    }

    fn detect(&self, line: &str) -> Option<DetectionKind> {
        let captures = self.pattern.captures(line)?;
        let failed_tests: u32 = captures.get(1)?.as_str().parse().ok()?;
        Some(DetectionKind::TestFailure {
            failed_tests,
            output: line.to_string(),
        })
    }
}

struct AuthDetector {
    oauth_url: Regex,
}

impl AuthDetector {
    fn new() -> Self {
        Self {
            oauth_url: Regex::new(
                r"https?://(?:github\.com/login/oauth|accounts\.google\.com/o/oauth2|[\w.-]+/oauth2?/authorize)\S*",
            )
            .expect("static pattern"),
        }
    }

    fn detect(&self, line: &str) -> Option<DetectionKind> {
        let matched = self.oauth_url.find(line)?;
        let auth_url = matched.as_str().to_string();
        let provider = if auth_url.contains("github.com") {
            "github"
        } else if auth_url.contains("google.com") {
            "google"
        } else {
            "unknown"
        }
        .to_string();
        Some(DetectionKind::AuthRequired { provider, auth_url })
    }
}

struct AgentActivity {
    last_activity_at: chrono::DateTime<Utc>,
    reported_stuck: bool,
}

/// Tracks `lastActivityAt` per agent and raises `stuck` detections once
/// silence exceeds the threshold. Any line of output resets the clock.
struct StuckDetector {
    silence_threshold: chrono::Duration,
    activity: Mutex<HashMap<AgentId, AgentActivity>>,
}

impl StuckDetector {
    fn new(silence_threshold_ms: u64) -> Self {
        Self {
            silence_threshold: chrono::Duration::milliseconds(silence_threshold_ms as i64),
            activity: Mutex::new(HashMap::new()),
        }
    }

    fn record_activity(&self, agent_id: &str, now: chrono::DateTime<Utc>) {
        let mut activity = self.activity.lock().expect("stuck detector lock poisoned");
        activity.insert(
            agent_id.to_string(),
            AgentActivity {
                last_activity_at: now,
                reported_stuck: false,
            },
        );
    }

    /// Called on the periodic tick; returns any newly-stuck agents.
    fn check(&self, now: chrono::DateTime<Utc>) -> Vec<(AgentId, DetectionKind)> {
        let mut activity = self.activity.lock().expect("stuck detector lock poisoned");
        let mut detections = Vec::new();
        for (agent_id, state) in activity.iter_mut() {
            if state.reported_stuck {
                continue;
            }
            let silent_for = now - state.last_activity_at;
            if silent_for >= self.silence_threshold {
                state.reported_stuck = true;
                detections.push((
                    agent_id.clone(),
                    DetectionKind::Stuck {
                        silent_duration_ms: silent_for.num_milliseconds().max(0) as u64,
                    },
                ));
            }
        }
        detections
    }
}

/// Per-agent ring buffer of recent lines, for debugging only.
struct RingBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, line: &str) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }
}

/// Dispatches stdout/stderr lines through the error, test-failure, and auth
/// detectors (in that priority order, first match wins) and separately
/// tracks liveness for the stuck detector and crash events fed directly from
/// sandbox exit codes.
pub struct PatternMatcher {
    error_detector: ErrorDetector,
    test_failure_detector: TestFailureDetector,
    auth_detector: AuthDetector,
    stuck_detector: StuckDetector,
    ring_buffers: Mutex<HashMap<AgentId, RingBuffer>>,
    ring_capacity: usize,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_RING_BUFFER_CAPACITY, DEFAULT_SILENCE_THRESHOLD_MS)
    }

    pub fn with_config(ring_capacity: usize, silence_threshold_ms: u64) -> Self {
        Self {
            error_detector: ErrorDetector::new(),
            test_failure_detector: TestFailureDetector::new(),
            auth_detector: AuthDetector::new(),
            stuck_detector: StuckDetector::new(silence_threshold_ms),
            ring_buffers: Mutex::new(HashMap::new()),
            ring_capacity,
        }
    }

    /// Feeds one line of output from `agent_id`'s sandbox, returning at most
    /// one `DetectionEvent` (first detector to match wins). Always records
    /// the line in the agent's ring buffer and resets its stuck clock.
    pub fn feed_line(&self, agent_id: &str, sandbox_id: &str, line: &str) -> Option<DetectionEvent> {
        self.ring_buffers
            .lock()
            .expect("ring buffer lock poisoned")
            .entry(agent_id.to_string())
            .or_insert_with(|| RingBuffer::new(self.ring_capacity))
            .push(line);

        let now = Utc::now();
        self.stuck_detector.record_activity(agent_id, now);

        let kind = self
            .error_detector
            .detect(line)
            .or_else(|| self.test_failure_detector.detect(line))
            .or_else(|| self.auth_detector.detect(line))?;

        Some(DetectionEvent {
            agent_id: agent_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            timestamp: now,
            kind,
        })
    }

    /// Crash detections are fed directly from sandbox exit status rather
    /// than parsed from a line.
    pub fn on_crash(&self, agent_id: &str, sandbox_id: &str, exit_code: i32) -> DetectionEvent {
        DetectionEvent {
            agent_id: agent_id.to_string(),
            sandbox_id: sandbox_id.to_string(),
            timestamp: Utc::now(),
            kind: DetectionKind::Crash { exit_code },
        }
    }

    /// Periodic stuck check (default every 30s); returns a `DetectionEvent`
    /// per newly-silent agent.
    pub fn check_stuck_agents(&self, sandbox_id_for: impl Fn(&str) -> String) -> Vec<DetectionEvent> {
        let now = Utc::now();
        self.stuck_detector
            .check(now)
            .into_iter()
            .map(|(agent_id, kind)| DetectionEvent {
                sandbox_id: sandbox_id_for(&agent_id),
                agent_id,
                timestamp: now,
                kind,
            })
            .collect()
    }

    pub fn recent_lines(&self, agent_id: &str) -> Vec<String> {
        self.ring_buffers
            .lock()
            .expect("ring buffer lock poisoned")
            .get(agent_id)
            .map(|buffer| buffer.lines.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_wins_over_error_and_warning_in_same_line() {
        let matcher = PatternMatcher::new();
        let event = matcher
            .feed_line("a1", "sb1", "FATAL Error: system down")
            .expect("should detect");
        match event.kind {
            DetectionKind::Error { severity, .. } => assert_eq!(severity, ErrorSeverity::Fatal),
            other => panic!("expected Error(Fatal), got {other:?}"),
        }
    }

    #[test]
    fn plain_error_without_fatal_markers_is_error_severity() {
        let matcher = PatternMatcher::new();
        let event = matcher
            .feed_line("a1", "sb1", "Error: could not connect to database")
            .expect("should detect");
        match event.kind {
            DetectionKind::Error { severity, .. } => assert_eq!(severity, ErrorSeverity::Error),
            other => panic!("expected Error(Error), got {other:?}"),
        }
    }

    #[test]
    fn test_failure_line_extracts_failed_count() {
        let matcher = PatternMatcher::new();
        let event = matcher
            .feed_line("a1", "sb1", "Tests: 3 failed, 12 passed")
            .expect("should detect");
        match event.kind {
            DetectionKind::TestFailure { failed_tests, .. } => assert_eq!(failed_tests, 3),
            other => panic!("expected TestFailure, got {other:?}"),
        }
    }

    #[test]
    fn oauth_url_triggers_auth_required() {
        let matcher = PatternMatcher::new();
        let event = matcher
            .feed_line(
                "a1",
                "sb1",
                "Please authenticate: https://github.com/login/oauth/authorize?client_id=abc",
            )
            .expect("should detect");
        match event.kind {
            DetectionKind::AuthRequired { provider, .. } => assert_eq!(provider, "github"),
            other => panic!("expected AuthRequired, got {other:?}"),
        }
    }

    #[test]
    fn benign_line_produces_no_detection() {
        let matcher = PatternMatcher::new();
        assert!(matcher.feed_line("a1", "sb1", "compiling crate core v0.1.0").is_none());
    }

    #[test]
    fn stuck_detector_fires_once_silence_exceeds_threshold() {
        let matcher = PatternMatcher::with_config(DEFAULT_RING_BUFFER_CAPACITY, 0);
        matcher.feed_line("a1", "sb1", "working...");
        let events = matcher.check_stuck_agents(|_| "sb1".to_string());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, DetectionKind::Stuck { .. }));

        // Second check without new activity does not re-fire for the same agent.
        let events = matcher.check_stuck_agents(|_| "sb1".to_string());
        assert!(events.is_empty());
    }
}
