//! Queue Manager: the submission and inspection side of the job queue.

mod manager;

pub use manager::{AddJobResult, EnqueuedJob, QueueError, QueueManager};
