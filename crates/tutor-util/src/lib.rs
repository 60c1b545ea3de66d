//! Shared utilities for tutord
//!
//! This crate provides:
//! - ID types (SessionId, PairingId, RequestId, JobId, UserId, TeacherId, ClientId)
//! - Time utilities (mockable wall clock, half-open time spans, RFC 3339 parsing)
//! - Default paths for socket, data, and config

mod ids;
mod paths;
mod time;

pub use ids::*;
pub use paths::*;
pub use time::*;
