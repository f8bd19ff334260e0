//! LedgerWatch CLI - operator commands
//!
//! Wires the audit engine to a SQLite database. No audit logic lives here.

pub mod commands;
pub mod context;

pub use context::AppContext;
