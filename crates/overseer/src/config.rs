//! Host configuration: how to launch the worker and how long to wait for it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::ModelSelector;
use crate::process::{CommandSpawner, WorkerSpawner};

/// Path of the worker entry point.
pub const WORKER_PATH_ENV: &str = "OVERSEER_WORKER_PATH";
/// Backend connection URL handed to the worker at start.
pub const BACKEND_URL_ENV: &str = "OVERSEER_BACKEND_URL";
/// Log verbosity handed to the worker at start (also read by our binaries).
pub const LOG_ENV: &str = "OVERSEER_LOG";
/// Model endpoint credentials. Host-only, never forwarded to the worker.
pub const MODEL_URL_ENV: &str = "OVERSEER_MODEL_URL";
pub const MODEL_API_KEY_ENV: &str = "OVERSEER_MODEL_API_KEY";
pub const MODEL_NAME_ENV: &str = "OVERSEER_MODEL_NAME";

/// Variables stripped from the worker environment.
pub const HOST_ONLY_ENV: &[&str] = &[MODEL_API_KEY_ENV, MODEL_URL_ENV];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Process-start parameters of the worker.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub backend_url: Option<String>,
    pub log_level: Option<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Read [`WORKER_PATH_ENV`], [`BACKEND_URL_ENV`] and [`LOG_ENV`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let program = std::env::var_os(WORKER_PATH_ENV).ok_or(ConfigError::Missing(WORKER_PATH_ENV))?;
        let mut spec = Self::new(program);
        spec.backend_url = std::env::var(BACKEND_URL_ENV).ok();
        spec.log_level = std::env::var(LOG_ENV).ok();
        Ok(spec)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = Some(url.into());
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Clone)]
pub struct OrchestratorConfig {
    pub launch: LaunchSpec,
    /// Bound on the readiness handshake.
    pub ready_timeout: Duration,
    /// Delay between the shutdown request and the terminate signal.
    pub shutdown_grace: Duration,
    /// Delay between the terminate signal and the kill signal.
    pub kill_timeout: Duration,
    /// Timeout for calls that don't pass their own.
    pub request_timeout: Duration,
    /// Fallback chain used when a capability request names no selectors.
    pub default_selectors: Vec<ModelSelector>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl OrchestratorConfig {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            ready_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_millis(500),
            kill_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            default_selectors: vec![ModelSelector::any()],
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_default_selectors(mut self, selectors: Vec<ModelSelector>) -> Self {
        self.default_selectors = selectors;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// Parse a duration given in (possibly fractional) seconds.
pub fn parse_secs(name: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| ConfigError::Invalid {
            name,
            reason: format!("expected seconds, got {raw:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let config = OrchestratorConfig::new(LaunchSpec::new("worker"));
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
        assert_eq!(config.kill_timeout, Duration::from_secs(5));
        assert_eq!(config.default_selectors, vec![ModelSelector::any()]);
    }

    #[test]
    fn launch_spec_builder() {
        let spec = LaunchSpec::new("/opt/worker")
            .with_args(["--mode", "agent"])
            .with_backend_url("http://localhost:9000")
            .with_log_level("debug")
            .with_env("EXTRA", "1");
        assert_eq!(spec.program, PathBuf::from("/opt/worker"));
        assert_eq!(spec.args, vec!["--mode", "agent"]);
        assert_eq!(spec.backend_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(spec.log_level.as_deref(), Some("debug"));
        assert_eq!(spec.env, vec![("EXTRA".to_string(), "1".to_string())]);
    }

    #[test]
    fn parse_secs_accepts_fractions() {
        assert_eq!(parse_secs("X", "1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_secs("X", "-1").is_err());
        assert!(parse_secs("X", "soon").is_err());
    }
}
