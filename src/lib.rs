pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod job;
pub mod progress;
pub mod remote;
pub mod runner;
pub mod scheduler;
pub mod script;
pub mod shutdown;
pub mod store;
pub mod transfer;
pub mod wait;

pub use batch::{Batch, JobInput};
pub use config::{ConnectionConfig, RunOptions, SchedulerConfig, SchedulerKind, WaitMode};
pub use error::{JobResult, Result, RunError};
pub use job::{Job, JobStatus, Task};
pub use runner::Runner;
