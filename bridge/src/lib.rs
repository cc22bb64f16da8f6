//! # Collection Bridge Library
//!
//! SQLite-backed ledger for firewall rule collection assembly.

// Core modules
pub mod bridge;
pub mod session;

// Re-export commonly used types
pub use bridge::{Bridge, StorageConfig};
pub use session::SqliteSession;
