//! System-wide default values shared across components.
//!
//! Most components own their own per-domain defaults (lock TTL in
//! `queue.rs`, grace period in `reassigner.rs`, health thresholds in
//! `health.rs`, ring buffer sizing in `detectors.rs`) so that `CoreConfig`
//! can override them independently. The handful of values here are either
//! shared by more than one module or belong to the HTTP/SSE surface, which
//! has no other natural home.

/// SSE heartbeat cadence for `GET /events`, per §4.2/§6: a periodic
/// `heartbeat` frame is emitted on this interval regardless of other
/// traffic, so clients can distinguish "quiet" from "disconnected".
pub const SSE_HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Per-subscriber bounded channel capacity for the event bus (§4.2).
pub const EVENT_BUS_SUBSCRIBER_CAPACITY: usize = 1024;

/// Window used by the `GET /costs` `dailySpend` view.
pub const COST_SUMMARY_WINDOW_DAYS: i64 = 7;

/// Minimum accepted length for `MASTER_KEY` and `API_KEY` once decoded/
/// provided, matching the orchestrator's original API key strength floor.
pub const MIN_SECRET_KEY_LENGTH: usize = 32;
