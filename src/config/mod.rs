//! Configuration for the orchestrator.
//!
//! Settings are env-first: every section resolves from environment
//! variables (loaded via dotenvy early in startup) with compiled-in
//! defaults. No database or file layer — the process is configured at
//! launch and immutable afterwards.

pub(crate) mod helpers;

use std::time::Duration;

use crate::error::ConfigError;
use helpers::{parse_list_env, parse_optional_env, parse_string_env};

/// Main configuration, one field per subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub progress: ProgressConfig,
    pub keep_alive: KeepAliveConfig,
    pub injection: InjectionConfig,
    pub http: HttpConfig,
    pub policy: PolicyConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Ok(Self {
            scheduler: SchedulerConfig::resolve()?,
            progress: ProgressConfig::resolve()?,
            keep_alive: KeepAliveConfig::resolve()?,
            injection: InjectionConfig::resolve()?,
            http: HttpConfig::resolve()?,
            policy: PolicyConfig::resolve()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            progress: ProgressConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            injection: InjectionConfig::default(),
            http: HttpConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

/// Scheduler capacity and per-task resource defaults.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently running tasks.
    pub max_concurrent: usize,
    /// Default idle timeout for tasks that don't set their own.
    pub default_idle_timeout: Duration,
    /// Default tool-call budget.
    pub default_max_tool_calls: u32,
    /// Default step budget.
    pub default_max_steps: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            default_idle_timeout: Duration::from_millis(120_000),
            default_max_tool_calls: 200,
            default_max_steps: 50,
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_concurrent: parse_optional_env("SCHEDULER_MAX_CONCURRENT", defaults.max_concurrent)?,
            default_idle_timeout: Duration::from_millis(parse_optional_env(
                "SCHEDULER_IDLE_TIMEOUT_MS",
                defaults.default_idle_timeout.as_millis() as u64,
            )?),
            default_max_tool_calls: parse_optional_env(
                "SCHEDULER_MAX_TOOL_CALLS",
                defaults.default_max_tool_calls,
            )?,
            default_max_steps: parse_optional_env(
                "SCHEDULER_MAX_STEPS",
                defaults.default_max_steps,
            )?,
        })
    }
}

/// Progress heartbeat cadence.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(15_000),
        }
    }
}

impl ProgressConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            interval: Duration::from_millis(parse_optional_env(
                "PROGRESS_INTERVAL_MS",
                defaults.interval.as_millis() as u64,
            )?),
        })
    }
}

/// Post-completion keep-alive windows for sub-agents and sandboxes.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// How long a completed task's sub-agent stays reachable for chat.
    pub agent: Duration,
    /// How long a sandbox with a published preview URL stays up.
    pub sandbox: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            agent: Duration::from_millis(1_800_000),
            sandbox: Duration::from_millis(1_800_000),
        }
    }
}

impl KeepAliveConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            agent: Duration::from_millis(parse_optional_env(
                "AGENT_KEEP_ALIVE_MS",
                defaults.agent.as_millis() as u64,
            )?),
            sandbox: Duration::from_millis(parse_optional_env(
                "SANDBOX_KEEP_ALIVE_MS",
                defaults.sandbox.as_millis() as u64,
            )?),
        })
    }
}

/// Truncation limits for text fed back into the parent conversation.
#[derive(Debug, Clone)]
pub struct InjectionConfig {
    /// Max chars of a sub-task result embedded in an injection message.
    pub result_truncate_chars: usize,
    /// Max chars of the previous result embedded in a redo prompt.
    pub redo_truncate_chars: usize,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            result_truncate_chars: 4_000,
            redo_truncate_chars: 2_000,
        }
    }
}

impl InjectionConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            result_truncate_chars: parse_optional_env(
                "INJECTION_TRUNCATE_CHARS",
                defaults.result_truncate_chars,
            )?,
            redo_truncate_chars: parse_optional_env(
                "REDO_TRUNCATE_CHARS",
                defaults.redo_truncate_chars,
            )?,
        })
    }
}

/// HTTP gateway settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required on every `/api/` route. Generated at startup
    /// when unset.
    pub auth_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            auth_token: None,
        }
    }
}

impl HttpConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: parse_string_env("HTTP_HOST", defaults.host)?,
            port: parse_optional_env("HTTP_PORT", defaults.port)?,
            auth_token: helpers::optional_env("HTTP_AUTH_TOKEN")?,
        })
    }
}

/// Safe-command policy overrides. Empty lists mean "use the shipped
/// defaults"; entries are additive on top of them.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    /// Extra regex patterns that force approval.
    pub extra_danger_patterns: Vec<String>,
    /// Extra command prefixes that are auto-allowed.
    pub extra_safe_prefixes: Vec<String>,
}

impl PolicyConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            extra_danger_patterns: parse_list_env("POLICY_EXTRA_DANGER_PATTERNS", Vec::new())?,
            extra_safe_prefixes: parse_list_env("POLICY_EXTRA_SAFE_PREFIXES", Vec::new())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.scheduler.max_concurrent, 5);
        assert_eq!(cfg.scheduler.default_idle_timeout, Duration::from_secs(120));
        assert_eq!(cfg.scheduler.default_max_tool_calls, 200);
        assert_eq!(cfg.scheduler.default_max_steps, 50);
        assert_eq!(cfg.progress.interval, Duration::from_secs(15));
        assert_eq!(cfg.keep_alive.agent, Duration::from_secs(1800));
        assert_eq!(cfg.keep_alive.sandbox, Duration::from_secs(1800));
        assert_eq!(cfg.injection.result_truncate_chars, 4_000);
        assert_eq!(cfg.injection.redo_truncate_chars, 2_000);
    }

    #[test]
    fn scheduler_resolves_overrides() {
        unsafe { std::env::set_var("SCHEDULER_MAX_CONCURRENT", "2") };
        let cfg = SchedulerConfig::resolve().unwrap();
        assert_eq!(cfg.max_concurrent, 2);
        unsafe { std::env::remove_var("SCHEDULER_MAX_CONCURRENT") };
    }
}
