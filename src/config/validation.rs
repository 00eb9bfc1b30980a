//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`FleetConfig`] that cannot
//! be expressed through the type system alone (range checks, watermark
//! ordering, known role names in bounds overrides).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{FleetConfig, ReplicaBounds};
use crate::agent::AgentType;

/// Hard ceiling on any per-attempt deadline: 365 days.
pub const TASK_TIMEOUT_CEILING_SECS: u64 = 365 * 24 * 60 * 60;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "scale.low_watermark").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn require_nonzero(errors: &mut Vec<ConfigError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(invalid(field, 0, "must be at least 1"));
    }
}

fn check_bounds(errors: &mut Vec<ConfigError>, field: &str, bounds: &ReplicaBounds) {
    if bounds.min > bounds.max {
        errors.push(invalid(
            &format!("{field}.min"),
            bounds.min,
            "must be \u{2264} max",
        ));
    }
}

/// Validate all semantic constraints on a [`FleetConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &FleetConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Health ───────────────────────────────────────────────────────
    let h = &config.health;
    require_nonzero(&mut errors, "health.probe_interval_secs", h.probe_interval_secs);
    require_nonzero(&mut errors, "health.missed_threshold", h.missed_threshold as u64);
    require_nonzero(&mut errors, "health.probe_timeout_ms", h.probe_timeout_ms);
    require_nonzero(
        &mut errors,
        "health.max_concurrent_probes",
        h.max_concurrent_probes as u64,
    );

    // ── Router ───────────────────────────────────────────────────────
    let r = &config.router;
    require_nonzero(&mut errors, "router.max_retries", r.max_retries as u64);
    require_nonzero(
        &mut errors,
        "router.default_task_timeout_secs",
        r.default_task_timeout_secs,
    );
    require_nonzero(&mut errors, "router.max_task_timeout_secs", r.max_task_timeout_secs);
    if r.max_task_timeout_secs > TASK_TIMEOUT_CEILING_SECS {
        errors.push(invalid(
            "router.max_task_timeout_secs",
            r.max_task_timeout_secs,
            "must not exceed 365 days",
        ));
    }
    if r.default_task_timeout_secs > r.max_task_timeout_secs {
        errors.push(invalid(
            "router.default_task_timeout_secs",
            r.default_task_timeout_secs,
            "must be \u{2264} router.max_task_timeout_secs",
        ));
    }
    require_nonzero(&mut errors, "router.max_queued", r.max_queued as u64);
    require_nonzero(
        &mut errors,
        "router.max_assignments_per_cycle",
        r.max_assignments_per_cycle as u64,
    );
    require_nonzero(&mut errors, "router.schedule_interval_ms", r.schedule_interval_ms);
    require_nonzero(&mut errors, "router.sweep_interval_secs", r.sweep_interval_secs);

    // ── Scale ────────────────────────────────────────────────────────
    let s = &config.scale;
    require_nonzero(
        &mut errors,
        "scale.evaluation_interval_secs",
        s.evaluation_interval_secs,
    );
    if !(s.low_watermark >= 0.0 && s.low_watermark <= 1.0) {
        errors.push(invalid(
            "scale.low_watermark",
            s.low_watermark,
            "must be between 0.0 and 1.0",
        ));
    }
    if !(s.high_watermark > 0.0) {
        errors.push(invalid(
            "scale.high_watermark",
            s.high_watermark,
            "must be greater than 0.0",
        ));
    }
    if !(s.step_ratio > 0.0 && s.step_ratio <= 1.0) {
        errors.push(invalid(
            "scale.step_ratio",
            s.step_ratio,
            "must be in (0.0, 1.0]",
        ));
    }
    require_nonzero(&mut errors, "scale.max_step", s.max_step as u64);
    if !(0.0..=1.0).contains(&s.unhealthy_threshold) {
        errors.push(invalid(
            "scale.unhealthy_threshold",
            s.unhealthy_threshold,
            "must be between 0.0 and 1.0",
        ));
    }
    require_nonzero(&mut errors, "scale.history_len", s.history_len as u64);
    check_bounds(&mut errors, "scale.default_bounds", &s.default_bounds);
    for (name, bounds) in &s.bounds {
        if AgentType::from_name(name).is_none() {
            errors.push(invalid(
                &format!("scale.bounds.{name}"),
                name,
                "is not a known agent type",
            ));
        }
        check_bounds(&mut errors, &format!("scale.bounds.{name}"), bounds);
    }

    // ── Coordinator ──────────────────────────────────────────────────
    let c = &config.coordinator;
    require_nonzero(
        &mut errors,
        "coordinator.dispatch_workers",
        c.dispatch_workers as u64,
    );
    require_nonzero(
        &mut errors,
        "coordinator.event_window_len",
        c.event_window_len as u64,
    );
    require_nonzero(
        &mut errors,
        "coordinator.stats_interval_secs",
        c.stats_interval_secs,
    );
    // Semaphore::MAX_PERMITS is usize::MAX >> 3; acquire_many takes u32.
    if c.dispatch_workers > u32::MAX as usize {
        errors.push(invalid(
            "coordinator.dispatch_workers",
            c.dispatch_workers,
            "must fit in a u32",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
