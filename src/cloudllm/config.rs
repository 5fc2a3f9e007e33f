//! Runtime configuration for the orchestrator, sourced from the environment.
//!
//! Mirrors the teacher's "no config-file dependency" ethos: every knob is a
//! `std::env` lookup with a sane default, overridable via builder methods for
//! tests and embedders that construct an [`OrchestratorConfig`] programmatically
//! instead of through the process environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default location for the SQLite-backed conversation/task store.
const DEFAULT_DATABASE_PATH: &str = "stockbuddy.db";

/// Default time-to-live for an in-memory [`crate::cloudllm::model::ExecutionContext`]
/// awaiting user input before it is treated as abandoned.
const DEFAULT_EXECUTION_CONTEXT_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Path to the SQLite database file. Overridden by `DATABASE_PATH`.
    pub database_path: PathBuf,
    /// Verbose per-agent debug logging. Overridden by `AGENT_DEBUG` (truthy: 1/true/yes).
    pub agent_debug: bool,
    /// IANA timezone name used to resolve `dailyTime` schedules. Overridden by `TIMEZONE`.
    /// `None` falls back to UTC.
    pub timezone: Option<String>,
    /// Language hint passed to remote agents as execution metadata. Overridden by `LANG`.
    pub lang: String,
    /// How long a paused [`crate::cloudllm::model::ExecutionContext`] may sit idle
    /// before it is reaped. Overridden by `EXECUTION_CONTEXT_TTL_SECONDS`.
    pub execution_context_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            agent_debug: false,
            timezone: None,
            lang: "en".to_string(),
            execution_context_ttl: Duration::from_secs(DEFAULT_EXECUTION_CONTEXT_TTL_SECS),
        }
    }
}

impl OrchestratorConfig {
    /// Builds a config from the process environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = env::var("DATABASE_PATH") {
            if !v.trim().is_empty() {
                cfg.database_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = env::var("AGENT_DEBUG") {
            cfg.agent_debug = is_truthy(&v);
        }
        if let Ok(v) = env::var("TIMEZONE") {
            if !v.trim().is_empty() {
                cfg.timezone = Some(v);
            }
        }
        if let Ok(v) = env::var("LANG") {
            if !v.trim().is_empty() {
                cfg.lang = v;
            }
        }
        if let Ok(v) = env::var("EXECUTION_CONTEXT_TTL_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.execution_context_ttl = Duration::from_secs(secs);
            }
        }
        cfg
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_agent_debug(mut self, enabled: bool) -> Self {
        self.agent_debug = enabled;
        self
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_execution_context_ttl(mut self, ttl: Duration) -> Self {
        self.execution_context_ttl = ttl;
        self
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Initializes the `log` facade from `RUST_LOG`, with `AGENT_DEBUG` forcing
/// this crate's own target to `debug` regardless of `RUST_LOG`. Call once,
/// near the start of the embedding binary's `main`; a no-op (returns the
/// error rather than panicking) if a logger is already installed, so test
/// binaries that call this per-test don't abort the run.
pub fn init_logging() -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    if env::var("AGENT_DEBUG").map(|v| is_truthy(&v)).unwrap_or(false) {
        // `env!("CARGO_PKG_NAME")` is hyphenated; `log` targets use the crate's
        // module path, which rustc renders with underscores.
        builder.filter_module(&env!("CARGO_PKG_NAME").replace('-', "_"), log::LevelFilter::Debug);
    }
    builder.try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert!(!cfg.agent_debug);
        assert_eq!(cfg.timezone, None);
        assert_eq!(cfg.execution_context_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn truthy_parses_common_spellings() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["0", "false", "no", ""] {
            assert!(!is_truthy(v), "{v} should not be truthy");
        }
    }

    #[test]
    fn init_logging_does_not_panic_when_called_repeatedly() {
        let _ = init_logging();
        let _ = init_logging();
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = OrchestratorConfig::default()
            .with_database_path("/tmp/x.db")
            .with_timezone("America/New_York")
            .with_execution_context_ttl(Duration::from_secs(60));
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.timezone.as_deref(), Some("America/New_York"));
        assert_eq!(cfg.execution_context_ttl, Duration::from_secs(60));
    }
}
