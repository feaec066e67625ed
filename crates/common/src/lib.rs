//! Fleetrelay Common Library
//!
//! Shared types, error taxonomy, store and request authentication for the
//! fleetrelay control plane.

pub mod classify;
pub mod crypto;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use classify::{classify, Classification, ErrorClass};
pub use crypto::RequestVerifier;
pub use db::Store;
pub use error::{Error, Result};
pub use types::*;

/// Fleetrelay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current time as epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".fleetrelay")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
