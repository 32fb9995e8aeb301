//! # Tenure Config
//!
//! Configuration for Tenure components and the `tenure` host binary.
//!
//! Component policy is an explicit [`ComponentConfig`] value handed to every
//! component at construction. A process-wide default can be installed once at
//! startup with [`ComponentConfig::set_global_default`] for hosts that do not
//! want to thread it through by hand.

mod error;
mod loader;
mod schema;
mod validator;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationError, ValidationResult, ValidationWarning};
