//! Conductor: coordinates parallel worker agents on one shared source tree
//!
//! The binary wires the pieces together: configuration and logging, the
//! SQLite store, git workspaces, worker processes and the coordinator loop.

pub mod app;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logging;
pub mod workers;
pub mod workspace;

pub use config::Config;
pub use error::{AppError, Result};
