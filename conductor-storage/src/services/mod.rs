//! Services built on the repositories

pub mod mailbox;
pub mod registry;

pub use mailbox::{MailboxRouter, QueueStatus, RoutedMessage, SweepReport};
pub use registry::{ClaimGrant, RoleStatus, SingletonRegistry};
