//! Worker processes: launching, liveness and the terminal result marker

pub mod liveness;
pub mod marker;
pub mod process;

pub use liveness::SysinfoProcessProbe;
pub use marker::{read_marker, WorkerOutcome};
pub use process::{LaunchRequest, ProcessLauncher, ProcessStatus, WorkerLauncher};
