//! Persistence layer for the Conductor coordinator
//!
//! The store is the single source of truth shared by the coordinator and
//! every worker process. All mutations that can race are conditional
//! single-row statements whose `rows_affected` decides the winner.

pub mod error;
pub mod manager;
pub mod migrations;
pub mod repositories;
pub mod services;

pub use error::{Error, Result};
pub use manager::{DatabaseConfig, DatabaseStats, StorageManager};
pub use services::{MailboxRouter, SingletonRegistry};

/// Re-export core types for convenience
pub use conductor_core as core;
