//! Orchestration of normalized, grouped jobs across backends.
//!
//! Groups are processed concurrently, up to `max_workers` at a time. Inside
//! a group every step runs in order:
//! 1. Dedup lookup against the job store
//! 2. File resolution and script rendering
//! 3. Session open, input staging, submission in input order
//! 4. Waiting, result fetching and the final store update
//!
//! The session of a group is always closed, on error paths too.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::{self, Group, JobInput};
use crate::cache::{self, CacheLookup};
use crate::config::{RunOptions, WaitMode};
use crate::error::{JobResult, Result, RunError};
use crate::job::{Job, JobStatus};
use crate::progress::{NoopObserver, Phase, ProgressObserver};
use crate::remote::{DefaultSessionFactory, SessionFactory};
use crate::scheduler::{ExecutionContext, Scheduler, SchedulerRegistry};
use crate::store::{JobStore, StoreKey, StoreRegistry};
use crate::transfer;
use crate::wait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Status,
    Fetch,
}

/// Entry point for running, polling and collecting jobs.
#[derive(Clone)]
pub struct Runner {
    schedulers: SchedulerRegistry,
    sessions: Arc<dyn SessionFactory>,
    stores: Arc<StoreRegistry>,
    observer: Arc<dyn ProgressObserver>,
    cancel: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            schedulers: SchedulerRegistry::default(),
            sessions: Arc::new(DefaultSessionFactory),
            stores: Arc::new(StoreRegistry::new()),
            observer: Arc::new(NoopObserver),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_schedulers(mut self, schedulers: SchedulerRegistry) -> Self {
        self.schedulers = schedulers;
        self
    }

    pub fn with_session_factory(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_stores(mut self, stores: Arc<StoreRegistry>) -> Self {
        self.stores = stores;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Token that stops polling and cancels submitted jobs when triggered.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stores(&self) -> &Arc<StoreRegistry> {
        &self.stores
    }

    /// Run every job of `input`. One result per job, in input order.
    ///
    /// The outer error is reserved for invalid input; failures of single
    /// jobs or groups are reported in their slots.
    pub async fn run(
        &self,
        input: impl Into<JobInput>,
        options: &RunOptions,
    ) -> Result<Vec<JobResult>> {
        self.execute(input.into(), options, Mode::Run).await
    }

    /// Refresh the status of submitted jobs from their backends.
    pub async fn get_status(
        &self,
        input: impl Into<JobInput>,
        options: &RunOptions,
    ) -> Result<Vec<JobResult>> {
        self.execute(input.into(), options, Mode::Status).await
    }

    /// Copy results of finished jobs back to their local directories.
    pub async fn fetch_results(
        &self,
        input: impl Into<JobInput>,
        options: &RunOptions,
    ) -> Result<Vec<JobResult>> {
        self.execute(input.into(), options, Mode::Fetch).await
    }

    async fn execute(
        &self,
        input: JobInput,
        options: &RunOptions,
        mode: Mode,
    ) -> Result<Vec<JobResult>> {
        let jobs = batch::normalize(input, options, &self.stores).await?;
        let total = jobs.len();
        let groups = batch::group(jobs);
        tracing::info!(jobs = total, groups = groups.len(), mode = ?mode, "Starting");

        let semaphore = Arc::new(Semaphore::new(options.max_workers.max(1)));
        let positions: Vec<Vec<usize>> = groups.iter().map(|g| g.positions.clone()).collect();
        let mut set = JoinSet::new();
        for (index, group) in groups.into_iter().enumerate() {
            let runner = self.clone();
            let options = options.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let results = match mode {
                    Mode::Run => runner.run_group(group, &options).await,
                    Mode::Status => runner.status_group(group).await,
                    Mode::Fetch => runner.fetch_group(group, &options).await,
                };
                (index, results)
            });
        }

        let mut slots: Vec<Option<JobResult>> = (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, results)) => {
                    for (position, result) in positions[index].iter().zip(results) {
                        slots[*position] = Some(result);
                    }
                }
                Err(e) => tracing::error!(error = %e, "Group task failed"),
            }
        }
        Ok(slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(RunError::Submission("group processing aborted".to_string()))
                })
            })
            .collect())
    }

    async fn store_for(&self, job: &Job) -> Result<Arc<dyn JobStore>> {
        self.stores.open(job.database()).await
    }

    /// Open a session for the group, reporting failures as connection errors.
    async fn open_context(&self, group: &Group) -> Result<ExecutionContext> {
        let session = self
            .sessions
            .open(group.connection.as_ref())
            .await
            .map_err(|e| match e {
                RunError::Connection { .. } => e,
                other => RunError::connection(&group.key.connection, other.to_string()),
            })?;
        Ok(ExecutionContext::new(session)
            .with_connection(group.connection.clone())
            .with_observer(self.observer.clone())
            .with_cancel(self.cancel.child_token()))
    }

    async fn close_context(&self, scheduler: &dyn Scheduler, ctx: &ExecutionContext) {
        if let Err(e) = scheduler.teardown(ctx).await {
            tracing::warn!(host = %ctx.host(), error = %e, "Scheduler teardown failed");
        }
        if let Err(e) = ctx.session.close().await {
            tracing::warn!(host = %ctx.host(), error = %e, "Closing session failed");
        }
    }

    async fn run_group(&self, group: Group, options: &RunOptions) -> Vec<JobResult> {
        let label = group.key.to_string();
        let n = group.len();
        let mut results: Vec<Option<JobResult>> = (0..n).map(|_| None).collect();
        self.observer.on_phase(&label, Phase::Initialization);

        let scheduler = match self.schedulers.get(group.key.scheduler) {
            Ok(s) => s,
            Err(e) => return (0..n).map(|_| Err(e.clone())).collect(),
        };

        let mut pending: Vec<(usize, Job)> = Vec::new();
        for (i, mut job) in group.jobs.iter().cloned().enumerate() {
            let lookup = match self.store_for(&job).await {
                Ok(store) => cache::lookup(&mut job, store.as_ref()).await,
                Err(e) => Err(e),
            };
            match lookup {
                Ok(CacheLookup::Hit(record)) => results[i] = Some(Ok(record)),
                Ok(CacheLookup::Miss) => {
                    job.reset_for_run();
                    pending.push((i, job));
                }
                Err(e) => results[i] = Some(Err(e)),
            }
        }

        if pending.is_empty() {
            tracing::info!(group = %label, "All jobs found in store");
            return finish(results);
        }

        let mut prepared = Vec::with_capacity(pending.len());
        for (i, mut job) in pending {
            transfer::resolve_job(&mut job);
            match scheduler.render_script(&job) {
                Ok(script) => {
                    job.script = Some(script);
                    prepared.push((i, job));
                }
                Err(e) => results[i] = Some(Err(e)),
            }
        }

        if options.dry_run {
            for (i, job) in prepared {
                tracing::info!(job = %job.name, hash = ?job.hash, "Dry run, not submitting");
                results[i] = Some(Ok(job));
            }
            return finish(results);
        }

        let ctx = match self.open_context(&group).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(group = %label, error = %e, "Cannot open session");
                for (i, _) in prepared {
                    results[i] = Some(Err(e.clone()));
                }
                return finish(results);
            }
        };

        self.drive(scheduler.as_ref(), &ctx, &label, prepared, options, &mut results)
            .await;
        self.close_context(scheduler.as_ref(), &ctx).await;
        finish(results)
    }

    /// Stage, submit, wait, fetch and persist jobs on an open session.
    async fn drive(
        &self,
        scheduler: &dyn Scheduler,
        ctx: &ExecutionContext,
        label: &str,
        jobs: Vec<(usize, Job)>,
        options: &RunOptions,
        results: &mut [Option<JobResult>],
    ) {
        self.observer.on_phase(label, Phase::Transfer);
        for (_, job) in &jobs {
            if let Err(e) = scheduler.transfer_files(job, ctx).await {
                let e = match e {
                    RunError::Transfer(_) => e,
                    other => RunError::Transfer(other.to_string()),
                };
                tracing::error!(group = %label, job = %job.name, error = %e, "Staging inputs failed");
                for (i, _) in &jobs {
                    results[*i] = Some(Err(e.clone()));
                }
                return;
            }
        }

        self.observer.on_phase(label, Phase::Submission);
        let mut submitted: Vec<(usize, Job)> = Vec::with_capacity(jobs.len());
        for (i, mut job) in jobs {
            if ctx.cancel.is_cancelled() {
                job.update_status(JobStatus::Cancelled);
                job.fail_outputs("cancelled before submission");
                results[i] = Some(Ok(job));
                continue;
            }
            match scheduler.submit(&mut job, ctx).await {
                Ok(()) => {
                    if let Err(e) = self.persist(&mut job).await {
                        tracing::warn!(job = %job.name, error = %e, "Recording submitted job failed");
                    }
                    submitted.push((i, job));
                }
                Err(e) => {
                    tracing::error!(job = %job.name, error = %e, "Submission failed");
                    results[i] = Some(Err(e));
                }
            }
        }

        let (indices, mut active): (Vec<usize>, Vec<Job>) = submitted.into_iter().unzip();

        self.observer.on_phase(label, Phase::Running);
        let timeout = match options.wait {
            WaitMode::NoWait => None,
            WaitMode::Derived => Some(wait::derive_timeout(&active)),
            WaitMode::Timeout(t) => Some(t),
        };
        if let Some(timeout) = timeout {
            let summary = wait::wait(&mut active, scheduler, ctx, timeout, options.poll_unit).await;
            tracing::info!(
                group = %label,
                polls = summary.polls,
                finished = summary.finished,
                elapsed_secs = summary.elapsed.as_secs_f64(),
                "Wait finished"
            );
        }

        if ctx.cancel.is_cancelled() {
            for job in active.iter_mut().filter(|j| !scheduler.is_finished(j)) {
                if let Err(e) = scheduler.cancel(job, ctx).await {
                    tracing::warn!(job = %job.name, error = %e, "Cancelling job failed");
                }
                tracing::warn!(job = %job.name, job_id = ?job.id, "Run cancelled before job finished");
                job.fail_outputs("run cancelled");
            }
        }

        self.observer.on_phase(label, Phase::Finalization);
        for (i, mut job) in indices.into_iter().zip(active) {
            if scheduler.is_finished(&job) {
                if let Err(e) = scheduler.fetch_results(&mut job, ctx, options.fetch_policy).await {
                    tracing::error!(job = %job.name, error = %e, "Fetching results failed");
                    results[i] = Some(Err(e));
                    continue;
                }
            }
            results[i] = Some(self.persisted(job).await);
        }
    }

    async fn persist(&self, job: &mut Job) -> Result<()> {
        let store = self.store_for(job).await?;
        cache::record(job, store.as_ref()).await?;
        Ok(())
    }

    async fn persisted(&self, mut job: Job) -> JobResult {
        self.persist(&mut job).await?;
        Ok(job)
    }

    /// Load the stored record of `job` when one exists.
    async fn stored(&self, job: Job) -> Result<Job> {
        if job.store_id.is_some() {
            return Ok(job);
        }
        let mut job = job;
        let hash = job.ensure_hash()?;
        let store = self.store_for(&job).await?;
        Ok(store.get(&StoreKey::Hash(hash)).await?.unwrap_or(job))
    }

    async fn status_group(&self, group: Group) -> Vec<JobResult> {
        let n = group.len();
        let scheduler = match self.schedulers.get(group.key.scheduler) {
            Ok(s) => s,
            Err(e) => return (0..n).map(|_| Err(e.clone())).collect(),
        };
        let mut jobs = Vec::with_capacity(n);
        for job in group.jobs.iter().cloned() {
            jobs.push(self.stored(job).await);
        }
        let needs_backend = jobs
            .iter()
            .any(|j| matches!(j, Ok(job) if job.id.is_some() && !scheduler.is_finished(job)));
        if !needs_backend {
            return jobs;
        }

        let ctx = match self.open_context(&group).await {
            Ok(ctx) => ctx,
            Err(e) => return (0..n).map(|_| Err(e.clone())).collect(),
        };
        let mut results = Vec::with_capacity(n);
        for job in jobs {
            let result = match job {
                Ok(mut job) if job.id.is_some() && !scheduler.is_finished(&job) => {
                    match scheduler.get_status(&mut job, &ctx).await {
                        Ok(status) => {
                            tracing::info!(job = %job.name, job_id = ?job.id, status = %status, "Polled job");
                            self.persisted(job).await
                        }
                        Err(e) => Err(e),
                    }
                }
                other => other,
            };
            results.push(result);
        }
        self.close_context(scheduler.as_ref(), &ctx).await;
        results
    }

    async fn fetch_group(&self, group: Group, options: &RunOptions) -> Vec<JobResult> {
        let n = group.len();
        let scheduler = match self.schedulers.get(group.key.scheduler) {
            Ok(s) => s,
            Err(e) => return (0..n).map(|_| Err(e.clone())).collect(),
        };
        let ctx = match self.open_context(&group).await {
            Ok(ctx) => ctx,
            Err(e) => return (0..n).map(|_| Err(e.clone())).collect(),
        };
        let mut results = Vec::with_capacity(n);
        for job in group.jobs.iter().cloned() {
            let result = match self.stored(job).await {
                Ok(mut job) => {
                    if job.outputs.iter().all(|o| o.stdout.is_none()) {
                        transfer::resolve_job(&mut job);
                    }
                    match scheduler
                        .fetch_results(&mut job, &ctx, options.fetch_policy)
                        .await
                    {
                        Ok(()) => self.persisted(job).await,
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };
            results.push(result);
        }
        self.close_context(scheduler.as_ref(), &ctx).await;
        results
    }
}

fn finish(results: Vec<Option<JobResult>>) -> Vec<JobResult> {
    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(RunError::Submission("job was not processed".to_string()))))
        .collect()
}
