pub mod metadata;
pub mod output;
pub mod status;
pub mod task;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{ConnectionConfig, SchedulerKind, LOCALHOST};
use crate::error::{Result, RunError};

pub use metadata::JobMetadata;
pub use output::{Output, ResolvedFile, JOB_ID_PLACEHOLDER};
pub use status::JobStatus;
pub use task::{ContainerConfig, FileSpec, Task};

/// Placeholder replaced by the job hash after a script is rendered.
pub const JOB_HASH_PLACEHOLDER: &str = "{job_hash}";

const DEFAULT_JOB_NAME: &str = "batchrun_job";

/// Task fields that do not change what a job computes.
const HASH_EXCLUDED_FIELDS: &[&str] = &["force_recompute", "connection", "database", "wait_time"];

/// Rendered submission script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    pub content: String,
    #[serde(with = "task::secs")]
    pub walltime: Duration,
}

/// An ordered batch of tasks run together on one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Backend id, set on submission
    #[serde(default)]
    pub id: Option<u64>,
    /// Store record id
    #[serde(default)]
    pub store_id: Option<u64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub metadata: Vec<JobMetadata>,
    #[serde(default)]
    pub script: Option<Script>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job from tasks that share scheduler, connection and store.
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        validate_tasks(&tasks)?;
        let name = job_name(&tasks);
        let outputs = vec![Output::default(); tasks.len()];
        Ok(Self {
            id: None,
            store_id: None,
            name,
            hash: None,
            status: JobStatus::Unknown,
            metadata: Vec::new(),
            script: None,
            tasks,
            outputs,
            created_at: Utc::now(),
            completed_at: None,
        })
    }

    /// Build a job from a dict-shaped record. Unknown fields are ignored.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(RunError::Validation(
                "job record must be a JSON object".to_string(),
            ));
        };
        if !object.contains_key("tasks") {
            return Err(RunError::Validation(
                "job record has no tasks field".to_string(),
            ));
        }
        let mut job: Job = serde_json::from_value(value)
            .map_err(|e| RunError::Validation(format!("invalid job record: {e}")))?;
        validate_tasks(&job.tasks)?;
        if job.name.is_empty() {
            job.name = job_name(&job.tasks);
        }
        if job.outputs.len() != job.tasks.len() {
            job.outputs = vec![Output::default(); job.tasks.len()];
        }
        Ok(job)
    }

    pub fn validate(&self) -> Result<()> {
        validate_tasks(&self.tasks)?;
        if self.outputs.len() != self.tasks.len() {
            return Err(RunError::Validation(format!(
                "job {} has {} outputs for {} tasks",
                self.name,
                self.outputs.len(),
                self.tasks.len()
            )));
        }
        Ok(())
    }

    fn first(&self) -> &Task {
        // validated non-empty at construction
        &self.tasks[0]
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        self.first().scheduler.kind
    }

    pub fn connection(&self) -> Option<&ConnectionConfig> {
        self.first().connection.as_ref()
    }

    pub fn host(&self) -> &str {
        self.first().host()
    }

    pub fn is_remote(&self) -> bool {
        self.first().is_remote()
    }

    pub fn database(&self) -> Option<&str> {
        self.first().database.as_deref()
    }

    /// `user@host:port` of a remote connection, `localhost` otherwise.
    pub fn connection_identity(&self) -> String {
        connection_identity(self.connection())
    }

    pub fn force_recompute(&self) -> bool {
        self.tasks.iter().any(|t| t.force_recompute)
    }

    /// Content hash over scheduler, connection and the canonical task
    /// encoding. Status, ids and metadata never contribute.
    pub fn compute_hash(&self) -> Result<String> {
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let mut value = serde_json::to_value(task)?;
            if let Some(map) = value.as_object_mut() {
                for key in HASH_EXCLUDED_FIELDS {
                    map.remove(*key);
                }
            }
            tasks.push(value);
        }
        let canonical = serde_json::json!({
            "scheduler": self.scheduler_kind(),
            "connection": self.connection_identity(),
            "tasks": tasks,
        });
        let encoded = serde_json::to_vec(&canonical)?;
        let digest = Sha256::digest(&encoded);
        Ok(format!("{digest:x}"))
    }

    /// Compute the hash once and keep it on the job.
    pub fn ensure_hash(&mut self) -> Result<String> {
        if let Some(hash) = &self.hash {
            return Ok(hash.clone());
        }
        let hash = self.compute_hash()?;
        self.hash = Some(hash.clone());
        Ok(hash)
    }

    /// Monotonic status update. Returns whether the status changed.
    pub fn update_status(&mut self, new: JobStatus) -> bool {
        let changed = self.status.advance(new);
        if changed && self.status.is_terminal() {
            self.completed_at = Some(Utc::now());
            match self.status {
                JobStatus::Completed => {}
                JobStatus::Cancelled => {
                    tracing::warn!(job = %self.name, job_id = ?self.id, status = %self.status, "Job cancelled");
                }
                status => {
                    tracing::error!(job = %self.name, job_id = ?self.id, status = %status, "Job ended unsuccessfully");
                }
            }
        }
        changed
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Largest per-task wait budget.
    pub fn wait_budget(&self) -> Duration {
        self.tasks
            .iter()
            .map(Task::wait_budget)
            .max()
            .unwrap_or_default()
    }

    /// Tasks of a batch script run one after another.
    pub fn total_job_time(&self) -> Duration {
        self.tasks.iter().map(|t| t.job_time).sum()
    }

    /// Drop everything an earlier run left behind so the job can be
    /// submitted again. Store id and hash are kept.
    pub fn reset_for_run(&mut self) {
        self.id = None;
        self.status = JobStatus::Unknown;
        self.metadata.clear();
        self.script = None;
        self.completed_at = None;
        self.outputs = vec![Output::default(); self.tasks.len()];
    }

    /// Record the backend id and rewrite `{job_id}` in output locations.
    pub fn bind_job_id(&mut self, id: u64) {
        self.id = Some(id);
        for output in &mut self.outputs {
            output.bind_job_id(id);
        }
    }

    /// Attach an error to every output that does not already carry one.
    pub fn fail_outputs(&mut self, message: &str) {
        for output in &mut self.outputs {
            if output.error.is_none() {
                output.set_error(message);
            }
        }
    }

    /// Compact identifiers for reporting.
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            store_id: self.store_id,
            id: self.id,
            name: self.name.clone(),
            hash: self.hash.clone(),
            status: self.status,
        }
    }
}

/// Opaque identifiers of a job as printed by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub store_id: Option<u64>,
    pub id: Option<u64>,
    pub name: String,
    pub hash: Option<String>,
    pub status: JobStatus,
}

pub fn connection_identity(connection: Option<&ConnectionConfig>) -> String {
    match connection {
        Some(c) if !c.is_local() => c.identity(),
        _ => LOCALHOST.to_string(),
    }
}

fn validate_tasks(tasks: &[Task]) -> Result<()> {
    let Some(first) = tasks.first() else {
        return Err(RunError::Validation(
            "a job needs at least one task".to_string(),
        ));
    };
    if first.program.trim().is_empty() {
        return Err(RunError::Validation("task program is empty".to_string()));
    }
    let identity = connection_identity(first.connection.as_ref());
    for (i, task) in tasks.iter().enumerate() {
        if let Some(connection) = &task.connection {
            connection.validate()?;
        }
        if i == 0 {
            continue;
        }
        if task.program.trim().is_empty() {
            return Err(RunError::Validation(format!("task {i} program is empty")));
        }
        if task.scheduler != first.scheduler {
            return Err(RunError::Validation(format!(
                "task {i} uses scheduler {} but the job uses {}",
                task.scheduler.kind, first.scheduler.kind
            )));
        }
        let other = connection_identity(task.connection.as_ref());
        if other != identity {
            return Err(RunError::Validation(format!(
                "task {i} connects to {other} but the job connects to {identity}"
            )));
        }
        if task.database != first.database {
            return Err(RunError::Validation(format!(
                "task {i} uses a different job store than the rest of the job"
            )));
        }
    }
    Ok(())
}

fn job_name(tasks: &[Task]) -> String {
    let mut names = tasks.iter().map(|t| t.name.as_deref());
    match names.next().flatten() {
        Some(first) if names.all(|n| n == Some(first)) => first.to_string(),
        _ if tasks.len() == 1 => tasks[0].display_name(),
        _ => DEFAULT_JOB_NAME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    #[test]
    fn rejects_empty_job() {
        assert!(matches!(Job::new(vec![]), Err(RunError::Validation(_))));
    }

    #[test]
    fn rejects_mixed_schedulers() {
        let tasks = vec![
            Task::new("a"),
            Task::new("b").with_scheduler(SchedulerConfig::slurm()),
        ];
        assert!(matches!(Job::new(tasks), Err(RunError::Validation(_))));
    }

    #[test]
    fn rejects_mixed_connections() {
        let tasks = vec![
            Task::new("a").with_connection(ConnectionConfig::new("hpc1")),
            Task::new("b").with_connection(ConnectionConfig::new("hpc2")),
        ];
        assert!(matches!(Job::new(tasks), Err(RunError::Validation(_))));
    }

    #[test]
    fn outputs_follow_tasks() {
        let job = Job::new(vec![Task::new("a"), Task::new("b")]).unwrap();
        assert_eq!(job.outputs.len(), 2);
        assert_eq!(job.name, DEFAULT_JOB_NAME);
        assert_eq!(job.status, JobStatus::Unknown);
    }

    #[test]
    fn hash_ignores_status_and_force() {
        let mut a = Job::new(vec![Task::new("echo").with_args(["hi"])]).unwrap();
        let b = Job::new(vec![Task::new("echo")
            .with_args(["hi"])
            .with_force_recompute(true)])
        .unwrap();
        let before = a.compute_hash().unwrap();
        a.update_status(JobStatus::Completed);
        a.id = Some(7);
        assert_eq!(before, a.compute_hash().unwrap());
        assert_eq!(before, b.compute_hash().unwrap());
        assert_eq!(before.len(), 64);
    }

    #[test]
    fn hash_depends_on_arguments_and_host() {
        let a = Job::new(vec![Task::new("echo").with_args(["hi"])]).unwrap();
        let b = Job::new(vec![Task::new("echo").with_args(["bye"])]).unwrap();
        let c = Job::new(vec![Task::new("echo")
            .with_args(["hi"])
            .with_connection(ConnectionConfig::new("hpc"))])
        .unwrap();
        assert_ne!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
        assert_ne!(a.compute_hash().unwrap(), c.compute_hash().unwrap());
    }

    #[test]
    fn terminal_update_sets_completion_time() {
        let mut job = Job::new(vec![Task::new("true")]).unwrap();
        assert!(job.update_status(JobStatus::Running));
        assert!(job.completed_at.is_none());
        assert!(job.update_status(JobStatus::Failed));
        assert!(job.completed_at.is_some());
        assert!(!job.update_status(JobStatus::Running));
    }

    #[test]
    fn reset_clears_previous_run() {
        let mut job = Job::new(vec![Task::new("xtb")]).unwrap();
        job.ensure_hash().unwrap();
        job.store_id = Some(3);
        job.bind_job_id(4021);
        job.outputs[0].returncode = Some(1);
        job.outputs[0].set_error("Exit code: Some(1)");
        job.metadata.push(JobMetadata::default());
        job.update_status(JobStatus::Failed);

        job.reset_for_run();

        assert_eq!(job.id, None);
        assert_eq!(job.status, JobStatus::Unknown);
        assert!(job.completed_at.is_none());
        assert!(job.metadata.is_empty());
        assert_eq!(job.outputs[0].returncode, None);
        assert!(job.outputs[0].error.is_none());
        assert_eq!(job.store_id, Some(3));
        assert!(job.hash.is_some());
        assert!(job.update_status(JobStatus::Submitted));
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logs_of(f: impl FnOnce()) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn failed_terminal_status_is_logged_as_error() {
        let mut job = Job::new(vec![Task::new("xtb")]).unwrap();
        job.id = Some(4021);
        let logs = logs_of(|| {
            job.update_status(JobStatus::Running);
            job.update_status(JobStatus::OutOfMemory);
        });
        assert_eq!(logs.matches("ERROR").count(), 1);
        assert!(logs.contains("OUT_OF_MEMORY"));
        assert!(logs.contains("4021"));

        let mut done = Job::new(vec![Task::new("xtb")]).unwrap();
        let logs = logs_of(|| {
            done.update_status(JobStatus::Completed);
        });
        assert!(!logs.contains("ERROR"));
    }

    #[test]
    fn from_value_ignores_unknown_fields() {
        let value = serde_json::json!({
            "tasks": [{"program": "echo", "args": ["x"]}],
            "status": "RUNNING",
            "priority": 3
        });
        let job = Job::from_value(value).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.outputs.len(), 1);
        assert_eq!(job.name, "echo");
        assert!(Job::from_value(serde_json::json!({"id": 3})).is_err());
    }
}
