mod engine;
mod supervisor;

pub use engine::{FullSyncReport, QuickSyncReport, SyncConfig, SyncEngine, SyncError};
pub use supervisor::{
    JobOutcome, JobReport, JobResult, StartOutcome, SyncMode, SyncStatus, SyncSupervisor,
};
