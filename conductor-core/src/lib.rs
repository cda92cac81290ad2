//! Core domain models for the Conductor coordinator
//!
//! This crate contains the work item, message, role registration and agent
//! instance models, the task independence analyzer, and the seams (clock,
//! process probe, footprint resolver) the storage and runtime layers plug
//! into.

pub mod agent_instance;
pub mod analyzer;
pub mod clock;
pub mod config;
pub mod error;
pub mod footprint;
pub mod message;
pub mod registration;
pub mod routing;
pub mod work_item;

pub use error::{Error, Result};
