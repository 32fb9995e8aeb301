//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::{Config, UndisposedPolicy};

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Turn the first error into a [`ConfigError`], if any.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(err) => Err(ConfigError::Invalid {
                path: err.path,
                message: err.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_component(config, &mut result);
        Self::validate_logging(config, &mut result);

        result
    }

    fn validate_component(config: &Config, result: &mut ValidationResult) {
        let component = &config.component;

        if component.shutdown_timeout_ms == 0 {
            result.add_warning(ValidationWarning::new(
                "component.shutdown_timeout_ms",
                "Teardown barrier is unbounded, a stuck command will hang dispose",
            ));
        }

        if !component.strict_initialize {
            result.add_warning(ValidationWarning::new(
                "component.strict_initialize",
                "Repeated initialize calls will be silently ignored",
            ));
        }

        if !component.strict_dispose {
            result.add_warning(ValidationWarning::new(
                "component.strict_dispose",
                "Repeated dispose calls will be silently ignored",
            ));
        }

        if !component.enforce_thread_affinity {
            result.add_warning(ValidationWarning::new(
                "component.enforce_thread_affinity",
                "Cross-thread mutations will not be detected",
            ));
        }

        if component.effective_undisposed_policy() == UndisposedPolicy::Panic && !component.is_debug_mode() {
            result.add_warning(ValidationWarning::new(
                "component.undisposed_policy",
                "Panicking on undisposed components outside debug mode",
            ));
        }
    }

    fn validate_logging(config: &Config, result: &mut ValidationResult) {
        let level = config.logging.level.to_lowercase();
        // Directives like "tenure_core=debug" are passed through to EnvFilter untouched.
        if !level.contains('=') && !LOG_LEVELS.contains(&level.as_str()) {
            result.add_error(ValidationError::new(
                "logging.level",
                format!(
                    "Unknown log level '{}', valid values: {:?}",
                    config.logging.level, LOG_LEVELS
                ),
            ));
        }

        if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
            result.add_error(ValidationError::new(
                "logging.format",
                format!(
                    "Unknown log format '{}', valid values: {:?}",
                    config.logging.format, LOG_FORMATS
                ),
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
