//! Configuration validation

use crate::policy::{REQUEST_LIMIT_CEILING, SchedulingPolicy};
use crate::schema::{RawConfig, RawSchedulingConfig};
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("scheduling.{key}: {message}")]
    SchedulingError { key: &'static str, message: String },

    #[error("service.{key}: {message}")]
    ServiceError { key: &'static str, message: String },
}

fn scheduling(key: &'static str, message: impl Into<String>) -> ValidationError {
    ValidationError::SchedulingError {
        key,
        message: message.into(),
    }
}

/// Validate a raw configuration, collecting every problem
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = validate_scheduling(&config.scheduling);

    if let Some(path) = &config.service.socket_path
        && path.as_os_str().is_empty()
    {
        errors.push(ValidationError::ServiceError {
            key: "socket_path",
            message: "cannot be empty".into(),
        });
    }

    if let Some(path) = &config.service.data_dir
        && path.as_os_str().is_empty()
    {
        errors.push(ValidationError::ServiceError {
            key: "data_dir",
            message: "cannot be empty".into(),
        });
    }

    errors
}

fn validate_scheduling(raw: &RawSchedulingConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(max) = raw.max_reschedule_requests
        && !(1..=REQUEST_LIMIT_CEILING).contains(&max)
    {
        errors.push(scheduling(
            "max_reschedule_requests",
            format!("must be between 1 and {}, got {}", REQUEST_LIMIT_CEILING, max),
        ));
    }

    if raw.reminder_lead_minutes == Some(0) {
        errors.push(scheduling("reminder_lead_minutes", "must be positive"));
    }

    if raw.sweep_interval_hours == Some(0) {
        errors.push(scheduling("sweep_interval_hours", "must be positive"));
    }

    if raw.max_series_length == Some(0) {
        errors.push(scheduling("max_series_length", "must be positive"));
    }

    let defaults = SchedulingPolicy::default();
    let whole_minutes = |d: chrono::Duration| u32::try_from(d.num_minutes()).unwrap_or(u32::MAX);

    let min = raw
        .min_duration_minutes
        .unwrap_or(defaults.min_duration_minutes);
    let max = raw
        .max_duration_minutes
        .unwrap_or(defaults.max_duration_minutes);
    if min == 0 {
        errors.push(scheduling("min_duration_minutes", "must be positive"));
    }
    if min > max {
        errors.push(scheduling(
            "max_duration_minutes",
            format!("must be at least min_duration_minutes ({}), got {}", min, max),
        ));
    }

    // A candidate that is allowed to sit inside the cutoff could never be
    // rescheduled again once approved.
    let lead = raw
        .min_candidate_lead_minutes
        .unwrap_or_else(|| whole_minutes(defaults.min_candidate_lead));
    let cutoff = raw
        .reschedule_cutoff_minutes
        .unwrap_or_else(|| whole_minutes(defaults.reschedule_cutoff));
    if lead < cutoff {
        errors.push(scheduling(
            "min_candidate_lead_minutes",
            format!("must not be shorter than reschedule_cutoff_minutes ({})", cutoff),
        ));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(scheduling: RawSchedulingConfig) -> RawConfig {
        RawConfig {
            config_version: 1,
            service: Default::default(),
            scheduling,
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&config_with(Default::default())).is_empty());
    }

    #[test]
    fn request_limit_is_capped() {
        let errors = validate_config(&config_with(RawSchedulingConfig {
            max_reschedule_requests: Some(5),
            ..Default::default()
        }));
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ValidationError::SchedulingError { key: "max_reschedule_requests", .. }
        ));

        let errors = validate_config(&config_with(RawSchedulingConfig {
            max_reschedule_requests: Some(0),
            ..Default::default()
        }));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn all_errors_are_collected() {
        let errors = validate_config(&config_with(RawSchedulingConfig {
            reminder_lead_minutes: Some(0),
            min_duration_minutes: Some(60),
            max_duration_minutes: Some(30),
            min_candidate_lead_minutes: Some(5),
            reschedule_cutoff_minutes: Some(10),
            ..Default::default()
        }));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn candidate_lead_is_checked_against_default_cutoff() {
        let errors = validate_config(&config_with(RawSchedulingConfig {
            min_candidate_lead_minutes: Some(5),
            ..Default::default()
        }));
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ValidationError::SchedulingError { key: "min_candidate_lead_minutes", .. }
        ));

        let errors = validate_config(&config_with(RawSchedulingConfig {
            reschedule_cutoff_minutes: Some(90),
            ..Default::default()
        }));
        assert_eq!(errors.len(), 1);
    }
}
