//! Shared data model and queue storage for the judge worker and its tooling.

pub mod config;
pub mod status;
pub mod store;
pub mod types;

pub use config::Config;
pub use status::{QueueStatus, Severity};
pub use store::{JobStore, RequestStore, StoreError, StoreResult};
pub use types::{
    JobDetail, JobQueue, NewJob, PendingResult, RequestLog, RequestRef, ResultDetail, ResultQueue,
    TaskLog, TestCase,
};
