//! Persistence layer for tutord
//!
//! Provides:
//! - Pairings, sessions and reschedule requests
//! - Durable scheduled jobs (unique by name)
//! - Prepaid session balances
//! - History log (append-only)
//!
//! Repositories are stateless and take a `&Connection`, so the same call
//! works on a bare connection or inside a transaction opened with
//! [`SqliteStore::with_tx`].

mod balances;
mod history;
mod jobs;
mod pairings;
mod reschedules;
mod sessions;
mod sqlite;

pub use balances::*;
pub use history::*;
pub use jobs::*;
pub use pairings::*;
pub use reschedules::*;
pub use sessions::*;
pub use sqlite::*;

pub use rusqlite::Connection;

use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
