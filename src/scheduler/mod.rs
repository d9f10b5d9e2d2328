pub mod job;
pub mod reclaim;
pub mod reconciler;

pub use job::{Job, JobId, JobStatus};
pub use reclaim::{classify, Disposition};
pub use reconciler::{Scheduler, SchedulerSnapshot, TickError, TickReport};
