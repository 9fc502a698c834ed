//! Loads and validates runtime configuration for the coordination core.
//!
//! Grounded on the orchestrator's original `Config::load()` (`.env` via an
//! env-loading crate, then `std::env`, with validation failures surfaced as
//! `ConfigurationError` rather than a panic); this version validates the
//! coordination core's own knobs (health thresholds, grace period, sandbox
//! limits) instead of Claude/Discord credentials.

use crate::constants::MIN_SECRET_KEY_LENGTH;
use crate::error::{CoreError, Result};
use crate::health::HealthThresholds;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackendKind {
    /// Spawns OS subprocesses under a local workspace directory.
    Local,
    /// Delegates to a remote sandbox provider (network API is external; see
    /// the `SandboxBackend` trait for the interface this core depends on).
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub backend: SandboxBackendKind,
    /// Required when `backend = Remote`; ignored for `Local`.
    pub api_key: Option<String>,
    pub max_concurrent: usize,
    pub command_timeout_secs: u64,
    pub lifetime_secs: u64,
    pub base_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub enable_auth: bool,
    pub allowed_origins: Vec<String>,
}

/// Top-level configuration for the core, assembled from environment
/// variables by [`CoreConfig::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub project_id: String,
    pub health_thresholds: HealthThresholdsConfig,
    pub reassignment_grace_period_ms: u64,
    pub max_reassignments: u32,
    pub lock_ttl_minutes: i64,
    pub ring_buffer_capacity: usize,
    pub silence_threshold_ms: u64,
    pub sandbox: SandboxConfig,
    /// 32-byte base64 key for user-secret encryption. Accepted and
    /// shape-validated; encryption itself is out of scope for this core.
    pub master_key: Option<String>,
    pub webhook_url: Option<String>,
    pub api: ApiConfig,
}

/// Serializable mirror of [`HealthThresholds`] (which is `Copy` but not
/// `Serialize`) so the loaded config can round-trip through JSON/logging.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthThresholdsConfig {
    pub warning_secs: i64,
    pub critical_secs: i64,
    pub offline_secs: i64,
}

impl From<HealthThresholdsConfig> for HealthThresholds {
    fn from(value: HealthThresholdsConfig) -> Self {
        HealthThresholds {
            warning_secs: value.warning_secs,
            critical_secs: value.critical_secs,
            offline_secs: value.offline_secs,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl CoreConfig {
    /// Loads `.env` (if present) via `dotenvy`, then reads environment
    /// variables with defaults matching §5/§6 of the coordination spec.
    /// Returns `CoreError::Configuration` rather than panicking on any
    /// invalid value.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(_) => tracing::debug!("no .env file found, continuing with process environment"),
        }

        let project_id = env::var("PROJECT_ID").unwrap_or_default();
        if project_id.trim().is_empty() {
            return Err(CoreError::Configuration(config::ConfigError::Message(
                "PROJECT_ID environment variable is required and cannot be blank".to_string(),
            )));
        }

        let health_thresholds = HealthThresholdsConfig {
            warning_secs: env_parse("HEARTBEAT_WARNING_SECS", 120),
            critical_secs: env_parse("HEARTBEAT_CRITICAL_SECS", 300),
            offline_secs: env_parse("HEARTBEAT_OFFLINE_SECS", 600),
        };
        HealthThresholds::from(health_thresholds)
            .validate()
            .map_err(|msg| CoreError::Configuration(config::ConfigError::Message(msg)))?;

        let reassignment_grace_period_ms = env_parse("REASSIGNMENT_GRACE_PERIOD_MS", 300_000);
        let max_reassignments = env_parse("MAX_REASSIGNMENTS", 3);
        let lock_ttl_minutes = env_parse("LOCK_TTL_MINUTES", 30);
        let ring_buffer_capacity = env_parse("RING_BUFFER_CAPACITY", 1024);
        let silence_threshold_ms = env_parse("SILENCE_THRESHOLD_MS", 300_000);

        for (name, value) in [
            ("REASSIGNMENT_GRACE_PERIOD_MS", reassignment_grace_period_ms as i64),
            ("LOCK_TTL_MINUTES", lock_ttl_minutes),
            ("RING_BUFFER_CAPACITY", ring_buffer_capacity as i64),
            ("SILENCE_THRESHOLD_MS", silence_threshold_ms as i64),
        ] {
            if value <= 0 {
                return Err(CoreError::Configuration(config::ConfigError::Message(
                    format!("{name} must be a positive interval"),
                )));
            }
        }

        let backend = match env::var("SANDBOX_BACKEND").unwrap_or_else(|_| "local".to_string()).as_str() {
            "remote" => SandboxBackendKind::Remote,
            _ => SandboxBackendKind::Local,
        };
        let sandbox_api_key = env::var("SANDBOX_API_KEY").ok();
        if backend == SandboxBackendKind::Remote && sandbox_api_key.as_deref().unwrap_or("").trim().is_empty() {
            return Err(CoreError::Configuration(config::ConfigError::Message(
                "SANDBOX_API_KEY is required when SANDBOX_BACKEND=remote".to_string(),
            )));
        }

        let sandbox = SandboxConfig {
            backend,
            api_key: sandbox_api_key,
            max_concurrent: env_parse("SANDBOX_MAX_CONCURRENT", 10),
            command_timeout_secs: env_parse("SANDBOX_COMMAND_TIMEOUT_SECS", 60),
            lifetime_secs: env_parse("SANDBOX_LIFETIME_SECS", 300),
            base_dir: env::var("SANDBOX_BASE_DIR").unwrap_or_else(|_| "./sandboxes".to_string()),
        };

        let master_key = env::var("MASTER_KEY").ok();
        if let Some(key) = &master_key {
            use base64::Engine;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(key)
                .map_err(|_| {
                    CoreError::Configuration(config::ConfigError::Message(
                        "MASTER_KEY must be valid base64".to_string(),
                    ))
                })?;
            if decoded.len() != MIN_SECRET_KEY_LENGTH {
                return Err(CoreError::Configuration(config::ConfigError::Message(
                    format!("MASTER_KEY must decode to exactly {MIN_SECRET_KEY_LENGTH} bytes"),
                )));
            }
        }

        let webhook_url = env::var("WEBHOOK_URL").ok();

        let api_key = env::var("API_KEY").ok();
        let enable_auth = api_key.is_some();
        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("API_PORT", 3000),
            api_key,
            enable_auth,
            allowed_origins,
        };

        Ok(CoreConfig {
            project_id,
            health_thresholds,
            reassignment_grace_period_ms,
            max_reassignments,
            lock_ttl_minutes,
            ring_buffer_capacity,
            silence_threshold_ms,
            sandbox,
            master_key,
            webhook_url,
            api,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "PROJECT_ID",
            "HEARTBEAT_WARNING_SECS",
            "HEARTBEAT_CRITICAL_SECS",
            "HEARTBEAT_OFFLINE_SECS",
            "SANDBOX_BACKEND",
            "SANDBOX_API_KEY",
            "MASTER_KEY",
            "API_KEY",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn missing_project_id_is_a_configuration_error() {
        clear_env();
        let err = CoreConfig::load().unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    #[serial]
    fn valid_minimal_env_loads_with_defaults() {
        clear_env();
        env::set_var("PROJECT_ID", "proj-1");
        let config = CoreConfig::load().unwrap();
        assert_eq!(config.project_id, "proj-1");
        assert_eq!(config.health_thresholds.warning_secs, 120);
        assert!(!config.api.enable_auth);
    }

    #[test]
    #[serial]
    fn inverted_health_thresholds_are_rejected() {
        clear_env();
        env::set_var("PROJECT_ID", "proj-1");
        env::set_var("HEARTBEAT_WARNING_SECS", "500");
        env::set_var("HEARTBEAT_CRITICAL_SECS", "100");
        assert!(CoreConfig::load().is_err());
    }

    #[test]
    #[serial]
    fn remote_backend_requires_sandbox_api_key() {
        clear_env();
        env::set_var("PROJECT_ID", "proj-1");
        env::set_var("SANDBOX_BACKEND", "remote");
        assert!(CoreConfig::load().is_err());
        env::set_var("SANDBOX_API_KEY", "key-123");
        assert!(CoreConfig::load().is_ok());
    }

    #[test]
    #[serial]
    fn malformed_master_key_is_rejected() {
        clear_env();
        env::set_var("PROJECT_ID", "proj-1");
        env::set_var("MASTER_KEY", "not-base64-!!!");
        assert!(CoreConfig::load().is_err());
    }
}
