//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service-level settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Booking, negotiation and job timing rules
    #[serde(default)]
    pub scheduling: RawSchedulingConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path (default: $XDG_RUNTIME_DIR/tutord/tutord.sock)
    pub socket_path: Option<PathBuf>,

    /// Data directory for the SQLite store
    pub data_dir: Option<PathBuf>,
}

/// Scheduling rules. Every key is optional; see `SchedulingPolicy::default`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSchedulingConfig {
    /// Reschedule requests allowed per session (at most 4)
    pub max_reschedule_requests: Option<u32>,

    /// No new reschedule request this close to the start
    pub reschedule_cutoff_minutes: Option<u32>,

    /// Candidate dates must be at least this far in the future
    pub min_candidate_lead_minutes: Option<u32>,

    /// Reminder job fires this long before the session
    pub reminder_lead_minutes: Option<u32>,

    /// Notification-only jobs found more overdue than this at boot are dropped
    pub notification_grace_minutes: Option<u32>,

    /// How often the stale-job sweep runs
    pub sweep_interval_hours: Option<u32>,

    /// Overdue rows older than this are removed by the sweep
    pub stale_job_retention_hours: Option<u32>,

    /// Whether USER_ABSENT / TEACHER_ABSENT sessions still occupy the slot
    pub absent_sessions_block_slots: Option<bool>,

    pub min_duration_minutes: Option<u32>,

    pub max_duration_minutes: Option<u32>,

    /// Upper bound on occurrences in one recurring series
    pub max_series_length: Option<u32>,
}
