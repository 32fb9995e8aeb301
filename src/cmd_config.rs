//! `check-config` subcommand.

use std::path::Path;

use tenure_config::{ConfigLoader, ConfigValidator};

/// Load and validate `path`, printing what the validator found.
///
/// Returns `Ok(false)` when the file parsed but has validation errors.
pub(crate) fn check_config(path: &Path) -> Result<bool, Box<dyn std::error::Error>> {
    let config = ConfigLoader::load(path)?;
    let result = ConfigValidator::validate(&config);

    for warning in &result.warnings {
        println!("warning: {}: {}", warning.path, warning.message);
    }
    for error in &result.errors {
        println!("error: {}: {}", error.path, error.message);
    }

    if result.is_valid() {
        println!(
            "{}: ok ({} warning(s))",
            path.display(),
            result.warnings.len()
        );
    } else {
        println!("{}: {} error(s)", path.display(), result.errors.len());
    }
    Ok(result.is_valid())
}
