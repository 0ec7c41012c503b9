use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SchedulerKind;
use crate::error::{Result, RunError};
use crate::job::{Job, JobStatus, Output, ResolvedFile};
use crate::scheduler::{ExecutionContext, Scheduler};
use crate::script;
use crate::transfer;

/// Outcome of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Exited,
    TimedOut,
    Cancelled,
}

/// Runs tasks as subprocesses of this process.
///
/// Execution happens inside `submit`, so a job is terminal as soon as it
/// has been submitted. Tasks resolving to the same directory never run
/// at the same time.
#[derive(Debug)]
pub struct LocalScheduler {
    next_id: AtomicU64,
    dir_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            dir_locks: Mutex::new(HashMap::new()),
        }
    }

    fn dir_lock(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.dir_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Declared outputs already on disk. A task without declared outputs
    /// never qualifies.
    async fn outputs_present(output: &Output) -> bool {
        let declared: Vec<&Path> = output
            .output_file
            .iter()
            .chain(output.files_to_parse.iter())
            .map(|f| f.path.as_path())
            .collect();
        if declared.is_empty() {
            return false;
        }
        for path in declared {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    async fn run_task(
        &self,
        job: &mut Job,
        index: usize,
        command: &str,
        walltime: Duration,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutcome> {
        let task = &job.tasks[index];
        let output = &job.outputs[index];
        let work_dir = output
            .output_folder
            .as_ref()
            .map(|f| f.path.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&work_dir).await?;

        let lock = self.dir_lock(&work_dir);
        let _guard = lock.lock().await;

        let stdout = redirect(output.stdout.as_ref()).await?;
        let stderr = redirect(output.stderr.as_ref()).await?;

        tracing::info!(job = %job.name, task = index, command, dir = %work_dir.display(), "Executing task");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&work_dir)
            .envs(&task.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()?;

        let result = tokio::select! {
            status = tokio::time::timeout(walltime, child.wait()) => status,
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                job.outputs[index].set_error("cancelled");
                return Ok(TaskOutcome::Cancelled);
            }
        };

        let output = &mut job.outputs[index];
        match result {
            Ok(Ok(status)) => {
                output.returncode = status.code();
                if !status.success() {
                    output.set_error(format!("Exit code: {:?}", status.code()));
                }
                tracing::info!(
                    job = %job.name,
                    task = index,
                    exit_code = ?status.code(),
                    "Task finished"
                );
                Ok(TaskOutcome::Exited)
            }
            Ok(Err(e)) => {
                tracing::error!(job = %job.name, task = index, error = %e, "Task execution failed");
                output.set_error(e.to_string());
                Ok(TaskOutcome::Exited)
            }
            Err(_) => {
                let _ = child.kill().await;
                tracing::warn!(
                    job = %job.name,
                    task = index,
                    walltime_secs = walltime.as_secs(),
                    "Task exceeded walltime"
                );
                output.set_error(format!("timed out after {}s", walltime.as_secs()));
                Ok(TaskOutcome::TimedOut)
            }
        }
    }
}

/// Truncate `file` and hand it to the child as a stream.
async fn redirect(file: Option<&ResolvedFile>) -> Result<Stdio> {
    let Some(f) = file else {
        return Ok(Stdio::null());
    };
    let handle = tokio::fs::File::create(&f.path)
        .await
        .map_err(|e| RunError::Io(format!("cannot create {}: {e}", f.path.display())))?;
    Ok(Stdio::from(handle.into_std().await))
}

/// Terminal status of a job from its task outcomes.
fn final_status(outcomes: &[TaskOutcome], outputs: &[Output]) -> JobStatus {
    if outcomes.contains(&TaskOutcome::Cancelled) {
        JobStatus::Cancelled
    } else if outcomes.contains(&TaskOutcome::TimedOut) {
        JobStatus::Timeout
    } else if outputs.iter().all(Output::is_success) {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Local
    }

    async fn submit(&self, job: &mut Job, ctx: &ExecutionContext) -> Result<()> {
        let walltime = match &job.script {
            Some(script) => script.walltime,
            None => script::local::walltime(job),
        };
        let hash = job.ensure_hash()?;
        let commands = script::local::commands(job, &hash);
        if job.outputs.iter().any(|o| o.stdout.is_none()) {
            transfer::resolve_job(job);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        job.bind_job_id(id);
        job.update_status(JobStatus::Submitted);
        job.update_status(JobStatus::Running);
        ctx.observer.on_status(&job.name, job.status);

        let force = job.force_recompute();
        let mut outcomes = Vec::with_capacity(job.tasks.len());
        for (i, command) in commands.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                job.outputs[i].set_error("cancelled");
                outcomes.push(TaskOutcome::Cancelled);
                continue;
            }
            if !force && Self::outputs_present(&job.outputs[i]).await {
                tracing::info!(job = %job.name, task = i, "Outputs present, skipping task");
                job.outputs[i].returncode = Some(0);
                outcomes.push(TaskOutcome::Exited);
                continue;
            }
            let outcome = match self.run_task(job, i, command, walltime, ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    job.outputs[i].set_error(e.to_string());
                    TaskOutcome::Exited
                }
            };
            outcomes.push(outcome);
        }

        let status = final_status(&outcomes, &job.outputs);
        job.update_status(status);
        ctx.observer.on_status(&job.name, job.status);
        Ok(())
    }

    async fn get_status(&self, job: &mut Job, _ctx: &ExecutionContext) -> Result<JobStatus> {
        Ok(job.status)
    }

    async fn cancel(&self, job: &Job, _ctx: &ExecutionContext) -> Result<()> {
        tracing::debug!(job = %job.name, "Local tasks stop with the run token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_status_precedence() {
        let ok = Output {
            returncode: Some(0),
            ..Default::default()
        };
        let bad = Output {
            returncode: Some(1),
            ..Default::default()
        };
        assert_eq!(
            final_status(&[TaskOutcome::Exited], std::slice::from_ref(&ok)),
            JobStatus::Completed
        );
        assert_eq!(
            final_status(&[TaskOutcome::Exited, TaskOutcome::Exited], &[ok.clone(), bad]),
            JobStatus::Failed
        );
        assert_eq!(
            final_status(&[TaskOutcome::TimedOut, TaskOutcome::Cancelled], &[ok.clone(), ok]),
            JobStatus::Cancelled
        );
    }
}
