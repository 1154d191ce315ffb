pub mod pid;
pub mod scheduler;

pub use pid::{PidFilter, PidSettings};
pub use scheduler::{CycleOutcome, CycleReport, CycleScheduler, CycleStatus, StaticConstraintId};
