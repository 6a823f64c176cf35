pub mod admission;
pub mod aliases;
pub mod ids;
pub mod job;
pub mod manager;
pub mod sweeper;

pub use admission::{Admission, AdmissionController, SlotPermit};
pub use aliases::{AliasBook, AliasEntry};
pub use ids::IdAllocator;
pub use job::{JobId, JobOutcome, JobRecord, JobState, Submission};
pub use manager::{artifact_key, AliasTarget, JobManager, JobResult, Occupancy, RecoveryReport};
pub use sweeper::{RetentionSweeper, SweepReport};
