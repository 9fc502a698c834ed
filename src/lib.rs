//! # Agent Coordination Core
//!
//! A coordination core for multi-agent coding task orchestration: a
//! capability-priced task matcher with zone-based file access control, an
//! agent health monitor and task reassigner, a console-output observer
//! pipeline (pattern detection, decision engine, action executor,
//! escalation queue), a sandbox manager abstracting an ephemeral execution
//! backend, and a budget/cost ledger.
//!
//! ## Architecture
//!
//! - **State Store**: single-writer, thread-safe persistent store for
//!   projects, agents, tasks, file locks, cost events, action log, and
//!   escalations (`store`).
//! - **Event Bus**: in-process typed publish/subscribe over every store
//!   mutation, backing the HTTP/SSE surface (`bus`).
//! - **Zone Matcher** / **Capability Matcher**: file-path access control and
//!   capability-priced agent selection (`zones`, `capability`).
//! - **Task Queue & Lock Manager**: atomic task claiming with all-or-nothing
//!   file locking (`queue`).
//! - **Health Monitor** / **Task Reassigner**: heartbeat-based liveness
//!   classification and grace-period task reassignment (`health`,
//!   `reassigner`).
//! - **Sandbox Manager**: concurrency-capped ephemeral execution
//!   environments behind a pluggable backend (`sandbox`).
//! - **Pattern Detectors** / **Decision Engine** / **Action Executor** /
//!   **Escalation Queue**: the observer pipeline from console output to
//!   autonomous action or human escalation (`detectors`, `decision`,
//!   `actions`, `escalation`).
//! - **Budget & Cost Ledger**: append-only cost tracking with threshold
//!   alerts (`budget`).
//!
//! ## Ambient stack
//!
//! Configuration loading (`config`), the thin HTTP/SSE surface (`api`) and
//! its optional auth middleware (`auth`), and the data model (`models`) and
//! error taxonomy (`error`) round out the crate.

/// Optional bearer/api-key authentication middleware for the HTTP surface.
pub mod auth;
/// Autonomous action execution and action log.
pub mod actions;
/// Thin HTTP/SSE API surface.
pub mod api;
/// Append-only cost ledger and budget alerting.
pub mod budget;
/// In-process publish/subscribe event bus.
pub mod bus;
/// Capability-priced agent matching.
pub mod capability;
/// Runtime configuration loading and validation.
pub mod config;
/// Shared cross-cutting default values.
pub mod constants;
/// Decision engine mapping detections to autonomous actions or escalations.
pub mod decision;
/// Console-output pattern detectors.
pub mod detectors;
/// Unified error taxonomy.
pub mod error;
/// Prioritized, durable escalation queue.
pub mod escalation;
/// Agent liveness classification and periodic health scans.
pub mod health;
/// Core data model shared by every component.
pub mod models;
/// Atomic task claiming and file-lock management.
pub mod queue;
/// Grace-period task reassignment for offline agents.
pub mod reassigner;
/// Ephemeral sandbox execution backend and pooling.
pub mod sandbox;
/// Single-writer persistent state store.
pub mod store;
/// Glob-based file access control.
pub mod zones;

pub use error::{CoreError, Result};
