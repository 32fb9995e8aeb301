//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// A `${VAR}` reference names a variable missing from the environment.
    #[error("Config references ${{{name}}}, which is not set")]
    UnsetVariable { name: String },

    #[error("Variable pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),

    /// First error reported by the validator.
    #[error("Invalid value at {path}: {message}")]
    Invalid { path: String, message: String },

    #[error("Global default component configuration already installed")]
    GlobalAlreadySet,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}
