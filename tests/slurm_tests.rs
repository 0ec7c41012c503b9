//! SLURM backend tests against a session with canned command output.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use batchrun::config::{ConnectionConfig, SchedulerConfig, SlurmSettings};
use batchrun::error::{Result, RunError};
use batchrun::job::{Job, JobStatus, Task};
use batchrun::remote::{CommandOutput, RemoteSession};
use batchrun::scheduler::{ExecutionContext, Scheduler, SlurmScheduler};
use batchrun::transfer;

const ACCOUNTING: &str = "\
JobID|State|Submit|Start|End|Elapsed|Timelimit|CPUTime|MaxRSS|MaxVMSize|MaxDiskRead|MaxDiskWrite|ReqCPUS|AllocCPUS|AllocNodes|ReqMem|NodeList|ExitCode|
4021|FAILED|2024-03-01T10:00:00|2024-03-01T10:00:05|2024-03-01T10:01:05|00:01:00|01:00:00|00:02:00|||||2|2|1|2000M|c1-2|0:0|
4021.0|COMPLETED|2024-03-01T10:00:05|2024-03-01T10:00:05|2024-03-01T10:00:35|00:00:30||00:01:00|512K|1024K|||2|2|1||c1-2|0:0|
4021.1|FAILED|2024-03-01T10:00:35|2024-03-01T10:00:35|2024-03-01T10:01:05|00:00:30||00:01:00|2048K|4096K|||2|2|1||c1-2|3:0|
";

/// Answers each command with the first reply whose prefix matches; other
/// commands succeed with no output.
struct ScriptedSession {
    replies: Mutex<Vec<(String, CommandOutput)>>,
    executed: Mutex<Vec<(String, Option<PathBuf>)>>,
}

impl ScriptedSession {
    fn new() -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    fn reply(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.replies.lock().unwrap().push((
            prefix.to_string(),
            CommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_string(),
                stderr: if exit_code == 0 { String::new() } else { "error".to_string() },
            },
        ));
    }

    fn executed(&self) -> Vec<(String, Option<PathBuf>)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    fn host(&self) -> &str {
        "hpc"
    }

    async fn execute(&self, command: &str, cwd: Option<&Path>) -> Result<CommandOutput> {
        self.executed
            .lock()
            .unwrap()
            .push((command.to_string(), cwd.map(Path::to_path_buf)));
        let replies = self.replies.lock().unwrap();
        Ok(replies
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            }))
    }

    async fn upload(&self, _sources: &[PathBuf], _dest_dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn download(&self, _sources: &[PathBuf], _dest_dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn download_dir(&self, _dir: &Path, _dest_dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn slurm_task(program: &str, work_dir_remote: &str) -> Task {
    Task::new(program)
        .with_scheduler(SchedulerConfig::slurm())
        .with_connection(ConnectionConfig::new("hpc"))
        .with_work_dir_local("/home/me/w")
        .with_work_dir_remote(work_dir_remote)
}

fn prepared_job(tasks: Vec<Task>, scheduler: &SlurmScheduler) -> Job {
    let mut job = Job::new(tasks).unwrap();
    job.ensure_hash().unwrap();
    transfer::resolve_job(&mut job);
    job.script = Some(scheduler.render_script(&job).unwrap());
    job
}

fn fast_settings() -> SlurmSettings {
    SlurmSettings {
        status_attempts: 2,
        status_retry_delay: Duration::from_millis(1),
        ..SlurmSettings::default()
    }
}

fn context(session: &Arc<ScriptedSession>) -> ExecutionContext {
    ExecutionContext::new(session.clone())
}

#[tokio::test]
async fn test_submit_binds_job_id_into_paths() {
    let scheduler = SlurmScheduler::new(fast_settings());
    let session = Arc::new(ScriptedSession::new());
    session.reply("sbatch", 0, "4021\n");
    let mut job = prepared_job(vec![slurm_task("xtb", "/cluster/w/{job_id}")], &scheduler);

    scheduler.submit(&mut job, &context(&session)).await.unwrap();

    assert_eq!(job.id, Some(4021));
    assert_eq!(job.status, JobStatus::Submitted);
    let stdout = job.outputs[0].stdout.as_ref().unwrap();
    assert!(stdout.path.starts_with("/cluster/w/4021"));

    let executed = session.executed();
    let (command, cwd) = &executed[0];
    assert!(command.starts_with("sbatch --parsable job_"));
    assert!(command.ends_with(".sh"));
    assert_eq!(cwd.as_deref(), Some(Path::new("/cluster/w")));
}

#[tokio::test]
async fn test_failed_sbatch_is_a_submission_error() {
    let scheduler = SlurmScheduler::new(fast_settings());
    let session = Arc::new(ScriptedSession::new());
    session.reply("sbatch", 1, "");
    let mut job = prepared_job(vec![slurm_task("xtb", "/cluster/w")], &scheduler);

    let err = scheduler.submit(&mut job, &context(&session)).await.unwrap_err();

    assert!(matches!(err, RunError::Submission(_)));
    assert_eq!(job.id, None);
    assert_eq!(job.status, JobStatus::Unknown);
}

#[tokio::test]
async fn test_status_applies_steps_to_tasks() {
    let scheduler = SlurmScheduler::new(fast_settings());
    let session = Arc::new(ScriptedSession::new());
    session.reply("sacct", 0, ACCOUNTING);
    let mut job = prepared_job(
        vec![slurm_task("a", "/cluster/w"), slurm_task("b", "/cluster/w")],
        &scheduler,
    );
    job.id = Some(4021);
    job.update_status(JobStatus::Submitted);

    let status = scheduler.get_status(&mut job, &context(&session)).await.unwrap();

    assert_eq!(status, JobStatus::Failed);
    assert_eq!(job.status, JobStatus::Failed);
    assert!(scheduler.is_finished(&job));
    assert_eq!(job.metadata.len(), 2);
    assert_eq!(job.outputs[0].returncode, Some(0));
    assert_eq!(job.outputs[1].returncode, Some(3));
    assert_eq!(job.metadata[1].max_rss, Some(2048 * 1024));
}

#[tokio::test]
async fn test_malformed_accounting_is_unknown() {
    let scheduler = SlurmScheduler::new(fast_settings());
    let session = Arc::new(ScriptedSession::new());
    session.reply("sacct", 0, "{ not json");
    let mut job = prepared_job(vec![slurm_task("xtb", "/cluster/w")], &scheduler);
    job.id = Some(4021);
    job.update_status(JobStatus::Running);

    let status = scheduler.get_status(&mut job, &context(&session)).await.unwrap();

    assert_eq!(status, JobStatus::Unknown);
    assert_eq!(job.status, JobStatus::Running);
    assert!(!scheduler.is_finished(&job));
}

#[tokio::test]
async fn test_out_of_range_elapsed_is_unknown() {
    let scheduler = SlurmScheduler::new(fast_settings());
    let session = Arc::new(ScriptedSession::new());
    let line = format!("4021|RUNNING|||||99999999999999999-00:00:00{}0:0\n", "|".repeat(11));
    session.reply("sacct", 0, &line);
    let mut job = prepared_job(vec![slurm_task("xtb", "/cluster/w")], &scheduler);
    job.id = Some(4021);
    job.update_status(JobStatus::Submitted);

    let status = scheduler.get_status(&mut job, &context(&session)).await.unwrap();

    assert_eq!(status, JobStatus::Unknown);
    assert_eq!(job.status, JobStatus::Submitted);
}

#[tokio::test]
async fn test_stale_poll_does_not_revert_terminal_status() {
    let scheduler = SlurmScheduler::new(fast_settings());
    let session = Arc::new(ScriptedSession::new());
    let pending = format!("4021|PENDING{}\n", "|".repeat(17));
    session.reply("sacct", 0, &pending);
    let mut job = prepared_job(vec![slurm_task("xtb", "/cluster/w")], &scheduler);
    job.id = Some(4021);
    job.update_status(JobStatus::Completed);

    scheduler.get_status(&mut job, &context(&session)).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_invisible_job_retries_accounting() {
    let scheduler = SlurmScheduler::new(fast_settings());
    let session = Arc::new(ScriptedSession::new());
    let mut job = prepared_job(vec![slurm_task("xtb", "/cluster/w")], &scheduler);
    job.id = Some(4021);
    job.update_status(JobStatus::Submitted);

    let status = scheduler.get_status(&mut job, &context(&session)).await.unwrap();

    assert_eq!(status, JobStatus::Unknown);
    assert_eq!(job.status, JobStatus::Submitted);
    let queries = session
        .executed()
        .iter()
        .filter(|(c, _)| c.starts_with("sacct"))
        .count();
    assert_eq!(queries, 2);
}

#[tokio::test]
async fn test_cancel_issues_scancel() {
    let scheduler = SlurmScheduler::new(fast_settings());
    let session = Arc::new(ScriptedSession::new());
    let mut job = prepared_job(vec![slurm_task("xtb", "/cluster/w")], &scheduler);
    job.id = Some(4021);

    scheduler.cancel(&job, &context(&session)).await.unwrap();

    assert_eq!(session.executed()[0].0, "scancel 4021");
}
