//! Config validation CLI tool
//!
//! Validates a tutord configuration file and prints the effective rules.

use std::path::PathBuf;
use std::process::ExitCode;
use tutor_util::{default_config_path, format_duration};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a tutord configuration file.");
            eprintln!("Default location: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match tutor_config::load_config(&config_path) {
        Ok(policy) => {
            let s = &policy.scheduling;
            println!("Configuration is valid");
            println!();
            println!("  Config version:          {}", tutor_config::CURRENT_CONFIG_VERSION);
            println!("  Socket:                  {}", policy.service.socket_path.display());
            println!("  Data dir:                {}", policy.service.data_dir.display());
            println!("  Reschedule requests:     {}", s.max_reschedule_requests);
            println!("  Reschedule cutoff:       {}", format_duration(s.reschedule_cutoff));
            println!("  Candidate lead:          {}", format_duration(s.min_candidate_lead));
            println!("  Reminder lead:           {}", format_duration(s.reminder_lead));
            println!("  Notification grace:      {}", format_duration(s.notification_grace));
            println!("  Sweep every:             {}", format_duration(s.sweep_interval));
            println!("  Stale job retention:     {}", format_duration(s.stale_job_retention));
            println!(
                "  Duration range:          {}-{} minutes",
                s.min_duration_minutes, s.max_duration_minutes
            );
            println!("  Max series length:       {}", s.max_series_length);
            println!("  Absences block slots:    {}", s.absent_sessions_block_slots);
            ExitCode::SUCCESS
        }
        Err(tutor_config::ConfigError::ValidationFailed { errors }) => {
            eprintln!("Configuration has {} error(s):", errors.len());
            for error in errors {
                eprintln!("  - {}", error);
            }
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}
