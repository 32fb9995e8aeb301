//! Configuration schema definitions.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

static GLOBAL_DEFAULT: OnceLock<ComponentConfig> = OnceLock::new();

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub component: ComponentConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What to do when a component is dropped without having been disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UndisposedPolicy {
    /// Stay silent.
    Ignore,
    /// Log a warning through `tracing`.
    Warn,
    /// Panic, unless the thread is already unwinding.
    Panic,
}

/// Lifecycle policy shared by every component built from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// `initialize` fails when no parent component has been set.
    #[serde(default)]
    pub require_parent: bool,

    /// A second `initialize` fails instead of being a no-op.
    #[serde(default = "default_strict")]
    pub strict_initialize: bool,

    /// A second `dispose` fails instead of being a no-op.
    #[serde(default = "default_strict")]
    pub strict_dispose: bool,

    /// Mutating calls from a thread other than the owner are rejected.
    #[serde(default = "default_enforce_thread_affinity")]
    pub enforce_thread_affinity: bool,

    /// Upper bound for the teardown barrier, in milliseconds. 0 waits forever.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Unset means `Warn` in debug mode and `Ignore` otherwise.
    #[serde(default)]
    pub undisposed_policy: Option<UndisposedPolicy>,

    /// Forces debug behaviour on or off regardless of the build profile.
    #[serde(default)]
    pub debug_mode_override: Option<bool>,
}

fn default_strict() -> bool {
    true
}

fn default_enforce_thread_affinity() -> bool {
    true
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            require_parent: false,
            strict_initialize: default_strict(),
            strict_dispose: default_strict(),
            enforce_thread_affinity: default_enforce_thread_affinity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            undisposed_policy: None,
            debug_mode_override: None,
        }
    }
}

impl ComponentConfig {
    /// Lenient preset: repeated `initialize`/`dispose` calls are no-ops.
    pub fn lenient() -> Self {
        Self {
            strict_initialize: false,
            strict_dispose: false,
            ..Self::default()
        }
    }

    /// Teardown barrier bound, `None` when unbounded.
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        if self.shutdown_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.shutdown_timeout_ms))
        }
    }

    /// Whether debug-only diagnostics are active.
    pub fn is_debug_mode(&self) -> bool {
        self.debug_mode_override
            .unwrap_or(cfg!(debug_assertions))
    }

    /// The configured policy, or the debug-mode default when unset.
    pub fn effective_undisposed_policy(&self) -> UndisposedPolicy {
        match self.undisposed_policy {
            Some(policy) => policy,
            None if self.is_debug_mode() => UndisposedPolicy::Warn,
            None => UndisposedPolicy::Ignore,
        }
    }

    /// Install the process-wide default. Only the first call succeeds.
    pub fn set_global_default(config: ComponentConfig) -> Result<(), ConfigError> {
        GLOBAL_DEFAULT
            .set(config)
            .map_err(|_| ConfigError::GlobalAlreadySet)
    }

    /// The process-wide default, or [`ComponentConfig::default`] if none was installed.
    pub fn global_default() -> ComponentConfig {
        GLOBAL_DEFAULT.get().cloned().unwrap_or_default()
    }
}

/// Logging configuration for the host binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
