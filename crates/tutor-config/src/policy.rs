//! Validated policy structures

use crate::schema::{RawConfig, RawSchedulingConfig, RawServiceConfig};
use chrono::Duration;
use std::path::PathBuf;

/// Hard ceiling on reschedule requests per session
pub const REQUEST_LIMIT_CEILING: u32 = 4;

/// Validated policy ready for use by the engine and daemon
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub service: ServiceConfig,
    pub scheduling: SchedulingPolicy,
}

impl Policy {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            scheduling: SchedulingPolicy::from_raw(&raw.scheduling),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw
                .socket_path
                .unwrap_or_else(tutor_util::socket_path_without_env),
            data_dir: raw
                .data_dir
                .unwrap_or_else(tutor_util::data_dir_without_env),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: tutor_util::socket_path_without_env(),
            data_dir: tutor_util::data_dir_without_env(),
        }
    }
}

/// Timing and limit rules for booking, negotiation and deferred jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingPolicy {
    pub max_reschedule_requests: u32,
    pub reschedule_cutoff: Duration,
    pub min_candidate_lead: Duration,
    pub reminder_lead: Duration,
    pub notification_grace: Duration,
    pub sweep_interval: Duration,
    pub stale_job_retention: Duration,
    pub absent_sessions_block_slots: bool,
    pub min_duration_minutes: u32,
    pub max_duration_minutes: u32,
    pub max_series_length: u32,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        Self {
            max_reschedule_requests: REQUEST_LIMIT_CEILING,
            reschedule_cutoff: Duration::minutes(10),
            min_candidate_lead: Duration::hours(1),
            reminder_lead: Duration::minutes(30),
            notification_grace: Duration::hours(1),
            sweep_interval: Duration::weeks(1),
            stale_job_retention: Duration::weeks(1),
            absent_sessions_block_slots: false,
            min_duration_minutes: 15,
            max_duration_minutes: 240,
            max_series_length: 52,
        }
    }
}

impl SchedulingPolicy {
    fn from_raw(raw: &RawSchedulingConfig) -> Self {
        let d = Self::default();
        let mins = |v: Option<u32>, fallback: Duration| {
            v.map(|m| Duration::minutes(i64::from(m))).unwrap_or(fallback)
        };
        let hours = |v: Option<u32>, fallback: Duration| {
            v.map(|h| Duration::hours(i64::from(h))).unwrap_or(fallback)
        };

        Self {
            max_reschedule_requests: raw
                .max_reschedule_requests
                .unwrap_or(d.max_reschedule_requests),
            reschedule_cutoff: mins(raw.reschedule_cutoff_minutes, d.reschedule_cutoff),
            min_candidate_lead: mins(raw.min_candidate_lead_minutes, d.min_candidate_lead),
            reminder_lead: mins(raw.reminder_lead_minutes, d.reminder_lead),
            notification_grace: mins(raw.notification_grace_minutes, d.notification_grace),
            sweep_interval: hours(raw.sweep_interval_hours, d.sweep_interval),
            stale_job_retention: hours(raw.stale_job_retention_hours, d.stale_job_retention),
            absent_sessions_block_slots: raw
                .absent_sessions_block_slots
                .unwrap_or(d.absent_sessions_block_slots),
            min_duration_minutes: raw.min_duration_minutes.unwrap_or(d.min_duration_minutes),
            max_duration_minutes: raw.max_duration_minutes.unwrap_or(d.max_duration_minutes),
            max_series_length: raw.max_series_length.unwrap_or(d.max_series_length),
        }
    }
}
