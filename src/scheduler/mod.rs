//! Execution backends.
//!
//! A [`Scheduler`] turns a prepared [`Job`] into backend work and reports
//! on it:
//! - **Local**: runs every task as a subprocess during `submit`
//! - **Slurm**: submits a batch script with `sbatch` and polls `sacct`
//!
//! Backends are looked up by [`SchedulerKind`] in a [`SchedulerRegistry`],
//! which tests populate with mocks.

pub mod local;
pub mod sacct;
pub mod slurm;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, FetchPolicy, SchedulerKind, SlurmSettings};
use crate::error::{Result, RunError};
use crate::job::{Job, JobStatus, Script};
use crate::progress::{NoopObserver, ProgressObserver};
use crate::remote::{LocalSession, RemoteSession};
use crate::script;
use crate::transfer;

pub use local::LocalScheduler;
pub use slurm::SlurmScheduler;

/// Everything a backend needs to act on one group's host.
#[derive(Clone)]
pub struct ExecutionContext {
    pub session: Arc<dyn RemoteSession>,
    pub connection: Option<ConnectionConfig>,
    pub observer: Arc<dyn ProgressObserver>,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self {
            session,
            connection: None,
            observer: Arc::new(NoopObserver),
            cancel: CancellationToken::new(),
        }
    }

    /// Context on this machine with a [`LocalSession`].
    pub fn local() -> Self {
        Self::new(Arc::new(LocalSession::new()))
    }

    pub fn with_connection(mut self, connection: Option<ConnectionConfig>) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn host(&self) -> &str {
        self.session.host()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("host", &self.session.host())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    fn render_script(&self, job: &Job) -> Result<Script> {
        script::render(job)
    }

    /// Hand the job to the backend. Sets the backend id and moves the
    /// status to at least `SUBMITTED`.
    async fn submit(&self, job: &mut Job, ctx: &ExecutionContext) -> Result<()>;

    /// Query the backend and apply the answer to `job` monotonically.
    /// Returns the status the backend reported.
    async fn get_status(&self, job: &mut Job, ctx: &ExecutionContext) -> Result<JobStatus>;

    fn is_finished(&self, job: &Job) -> bool {
        job.is_finished()
    }

    /// Stage inputs (and the script) onto the execution host.
    async fn transfer_files(&self, job: &Job, ctx: &ExecutionContext) -> Result<()> {
        transfer::stage_in(job, ctx).await
    }

    async fn fetch_results(
        &self,
        job: &mut Job,
        ctx: &ExecutionContext,
        policy: FetchPolicy,
    ) -> Result<()> {
        transfer::fetch_out(job, ctx, policy).await
    }

    /// Release backend resources held for the group.
    async fn teardown(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Best-effort cancellation of a submitted job.
    async fn cancel(&self, job: &Job, ctx: &ExecutionContext) -> Result<()>;
}

/// Backends available to a runner, one per kind.
#[derive(Clone)]
pub struct SchedulerRegistry {
    schedulers: HashMap<SchedulerKind, Arc<dyn Scheduler>>,
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(LocalScheduler::new()))
            .with(Arc::new(SlurmScheduler::new(SlurmSettings::default())))
    }
}

impl SchedulerRegistry {
    pub fn empty() -> Self {
        Self {
            schedulers: HashMap::new(),
        }
    }

    /// Register `scheduler`, replacing any backend of the same kind.
    pub fn with(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.schedulers.insert(scheduler.kind(), scheduler);
        self
    }

    pub fn get(&self, kind: SchedulerKind) -> Result<Arc<dyn Scheduler>> {
        self.schedulers
            .get(&kind)
            .cloned()
            .ok_or_else(|| RunError::Validation(format!("no scheduler registered for {kind}")))
    }
}
