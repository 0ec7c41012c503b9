use async_trait::async_trait;

use crate::config::{SchedulerKind, SlurmSettings};
use crate::error::{Result, RunError};
use crate::job::{Job, JobStatus};
use crate::scheduler::sacct::{self, AccountingRecord};
use crate::scheduler::{ExecutionContext, Scheduler};
use crate::script::shell_quote;
use crate::transfer;

/// Batch queue reached through `sbatch`, `sacct` and `scancel` on the
/// session host.
#[derive(Debug, Clone, Default)]
pub struct SlurmScheduler {
    settings: SlurmSettings,
}

impl SlurmScheduler {
    pub fn new(settings: SlurmSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SlurmSettings {
        &self.settings
    }

    /// Query accounting, retrying while the job is not yet visible.
    async fn query(&self, job_id: u64, ctx: &ExecutionContext) -> Result<Vec<AccountingRecord>> {
        let command = sacct::query_command(&self.settings.status_command, job_id);
        let attempts = self.settings.status_attempts.max(1);
        for attempt in 1..=attempts {
            let out = ctx.session.execute(&command, None).await?;
            if !out.success() {
                return Err(RunError::Parse(format!(
                    "{} exited with {:?}: {}",
                    self.settings.status_command,
                    out.exit_code,
                    out.stderr.trim()
                )));
            }
            let records = sacct::parse(&out.stdout)?;
            if !records.is_empty() {
                return Ok(records);
            }
            tracing::debug!(job_id, attempt, attempts, "Job not in accounting yet");
            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.status_retry_delay) => {}
                    _ = ctx.cancel.cancelled() => break,
                }
            }
        }
        Ok(Vec::new())
    }
}

/// Apply accounting records to the job: status, per-task metadata and
/// return codes.
fn apply_records(job: &mut Job, job_id: u64, records: &[AccountingRecord]) -> JobStatus {
    let Some(record) = sacct::job_record(records, job_id) else {
        return JobStatus::Unknown;
    };
    let status = record.status;
    let mut metadata = Vec::with_capacity(job.tasks.len());
    for (i, output) in job.outputs.iter_mut().enumerate() {
        if let Some(task_record) = sacct::task_record(records, job_id, i) {
            metadata.push(task_record.metadata.clone());
            if status.is_terminal() {
                output.returncode = task_record.metadata.exit_code;
            }
        }
    }
    job.metadata = metadata;
    job.update_status(status);
    status
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    async fn submit(&self, job: &mut Job, ctx: &ExecutionContext) -> Result<()> {
        let Some(script) = job.script.clone() else {
            return Err(RunError::Submission(format!(
                "job {} has no rendered script",
                job.name
            )));
        };
        let (_, submit_dir) = transfer::submit_dirs(job);
        let command = format!(
            "{} --parsable {}",
            self.settings.submit_command,
            shell_quote(&script.name)
        );
        tracing::info!(job = %job.name, host = %ctx.host(), dir = %submit_dir.path.display(), "Submitting job");
        let out = ctx.session.execute(&command, Some(&submit_dir.path)).await?;
        if !out.success() {
            return Err(RunError::Submission(format!(
                "{} failed for {} ({:?}): {}",
                self.settings.submit_command,
                job.name,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        let id = sacct::parse_submit_output(&out.stdout)?;
        transfer::rebind_job_id(job, id);
        job.update_status(JobStatus::Submitted);
        tracing::info!(job = %job.name, job_id = id, "Job submitted");
        Ok(())
    }

    async fn get_status(&self, job: &mut Job, ctx: &ExecutionContext) -> Result<JobStatus> {
        let Some(id) = job.id else {
            return Ok(job.status);
        };
        let records = match self.query(id, ctx).await {
            Ok(records) => records,
            Err(RunError::Parse(message)) => {
                tracing::warn!(job = %job.name, job_id = id, error = %message, "Unreadable accounting output");
                return Ok(JobStatus::Unknown);
            }
            Err(e) => return Err(e),
        };
        Ok(apply_records(job, id, &records))
    }

    async fn cancel(&self, job: &Job, ctx: &ExecutionContext) -> Result<()> {
        let Some(id) = job.id else {
            return Ok(());
        };
        let command = format!("{} {id}", self.settings.cancel_command);
        let out = ctx.session.execute(&command, None).await?;
        if !out.success() {
            return Err(RunError::Submission(format!(
                "{} {id} failed: {}",
                self.settings.cancel_command,
                out.stderr.trim()
            )));
        }
        tracing::warn!(job = %job.name, job_id = id, "Cancelled job");
        Ok(())
    }
}
