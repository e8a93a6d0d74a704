//! Per-(channel, agent) observation tasks and their shared bookkeeping.

mod dedup;
mod registry;
mod scheduler;

pub use dedup::ParticipationDeduplicator;
pub use registry::{TaskKey, TaskRegistry, TaskTicket};
pub use scheduler::{Agent, ObservationScheduler, ScheduledTask, SchedulerParts, TaskError, TaskOutcome};
