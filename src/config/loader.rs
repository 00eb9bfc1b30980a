//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`FleetConfig`], and run
//! validation before returning.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::FleetConfig;

/// Load a [`FleetConfig`] from a TOML file.
///
/// # Returns
///
/// - `Ok(FleetConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,no_run
/// use tokio_fleet_coordinator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("fleet.toml"))?;
/// println!("probe every {}s", config.health.probe_interval_secs);
/// # Ok::<(), tokio_fleet_coordinator::config::validation::ConfigError>(())
/// ```
pub fn load_from_file(path: &Path) -> Result<FleetConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`FleetConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<FleetConfig, ConfigError> {
    let config: FleetConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[health]
probe_interval_secs = 5
missed_threshold = 3
unhealthy_grace_secs = 30

[router]
max_retries = 4
capacity_threshold_secs = 10

[scale]
cooldown_secs = 60
high_watermark = 3.0

[scale.bounds.quantum_mechanics]
min = 1
max = 50

[coordinator]
dispatch_workers = 64
"#;

    #[test]
    fn test_load_from_str_valid() {
        let config = load_from_str(VALID_TOML, "inline");
        assert!(config.is_ok(), "{config:?}");
        if let Ok(c) = config {
            assert_eq!(c.health.probe_interval_secs, 5);
            assert_eq!(c.router.max_retries, 4);
            assert_eq!(c.coordinator.dispatch_workers, 64);
            assert_eq!(c.scale.bounds.len(), 1);
        }
    }

    #[test]
    fn test_load_from_str_parse_error_names_source() {
        let err = load_from_str("[health\nprobe", "broken.toml").err();
        assert!(matches!(err, Some(ConfigError::Parse { ref file, .. }) if file == "broken.toml"));
    }

    #[test]
    fn test_load_from_str_validation_joins_all_violations() {
        let toml = "[router]\nmax_retries = 0\n[coordinator]\ndispatch_workers = 0\n";
        match load_from_str(toml, "inline") {
            Err(ConfigError::Validation(msg)) => {
                assert!(msg.contains("router.max_retries"));
                assert!(msg.contains("coordinator.dispatch_workers"));
                assert!(msg.contains("; "));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap_or_else(|e| panic!("{e}"));
        file.write_all(VALID_TOML.as_bytes())
            .unwrap_or_else(|e| panic!("{e}"));
        let config = load_from_file(file.path());
        assert!(config.is_ok(), "{config:?}");
    }

    #[test]
    fn test_load_from_file_missing_is_io_error() {
        let err = load_from_file(Path::new("/definitely/not/here/fleet.toml")).err();
        assert!(matches!(err, Some(ConfigError::Io { .. })));
    }

    #[test]
    fn test_rejects_unknown_field_types() {
        let err = load_from_str("[health]\nprobe_interval_secs = \"ten\"\n", "inline").err();
        assert!(matches!(err, Some(ConfigError::Parse { .. })));
    }
}
