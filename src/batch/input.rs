use serde_json::Value;

use crate::config::RunOptions;
use crate::error::{Result, RunError};
use crate::job::{Job, Task};
use crate::store::{StoreKey, StoreRegistry};

/// Shapes of work a caller can hand to the runner.
#[derive(Debug, Clone)]
pub enum JobInput {
    Task(Task),
    /// One job per task
    Tasks(Vec<Task>),
    /// Explicit grouping of tasks into jobs
    Batch(Batch),
    Job(Job),
    /// Dict-shaped job record; unknown fields are ignored
    Record(Value),
    /// Job already in the store
    StoreId(u64),
    Mixed(Vec<JobInput>),
}

/// Tasks grouped into jobs. Built through [`Batch::builder`] so that no
/// job is empty.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    jobs: Vec<Vec<Task>>,
}

impl Batch {
    pub fn builder() -> BatchBuilder {
        BatchBuilder::default()
    }

    pub fn jobs(&self) -> &[Vec<Task>] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BatchBuilder {
    jobs: Vec<Vec<Task>>,
}

impl BatchBuilder {
    /// Add a job made of `tasks`.
    pub fn job(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.jobs.push(tasks.into_iter().collect());
        self
    }

    /// Add a job with a single task.
    pub fn task(mut self, task: Task) -> Self {
        self.jobs.push(vec![task]);
        self
    }

    pub fn build(self) -> Result<Batch> {
        if let Some(i) = self.jobs.iter().position(Vec::is_empty) {
            return Err(RunError::Validation(format!("batch job {i} has no tasks")));
        }
        Ok(Batch { jobs: self.jobs })
    }
}

impl From<Task> for JobInput {
    fn from(task: Task) -> Self {
        JobInput::Task(task)
    }
}

impl From<Vec<Task>> for JobInput {
    fn from(tasks: Vec<Task>) -> Self {
        JobInput::Tasks(tasks)
    }
}

impl From<Batch> for JobInput {
    fn from(batch: Batch) -> Self {
        JobInput::Batch(batch)
    }
}

impl From<Job> for JobInput {
    fn from(job: Job) -> Self {
        JobInput::Job(job)
    }
}

fn task_from_value(value: Value) -> Result<Task> {
    serde_json::from_value(value).map_err(|e| RunError::Validation(format!("invalid task: {e}")))
}

fn store_id(value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| RunError::Validation(format!("invalid job id: {value}")))
}

impl JobInput {
    /// Interpret JSON input.
    ///
    /// An object is a task, or a job record when it has a `tasks` field. A
    /// number is a stored job id. A list holds any of those or sub-lists of
    /// tasks, each sub-list forming one job. Deeper nesting is rejected.
    pub fn from_json(value: Value) -> Result<Self> {
        if value.get("tasks").is_some() {
            return Ok(JobInput::Record(value));
        }
        match value {
            Value::Object(_) => Ok(JobInput::Task(task_from_value(value)?)),
            Value::Number(_) => Ok(JobInput::StoreId(store_id(&value)?)),
            Value::Array(items) => {
                let mut inputs = Vec::with_capacity(items.len());
                for item in items {
                    inputs.push(match item {
                        Value::Array(sub) => {
                            let tasks = sub
                                .into_iter()
                                .map(|t| match t {
                                    Value::Object(_) => task_from_value(t),
                                    Value::Array(_) => Err(RunError::Validation(
                                        "job input nested deeper than two levels".to_string(),
                                    )),
                                    other => Err(RunError::Validation(format!(
                                        "expected a task object, got {other}"
                                    ))),
                                })
                                .collect::<Result<Vec<_>>>()?;
                            JobInput::Batch(Batch::builder().job(tasks).build()?)
                        }
                        other => Self::from_json(other)?,
                    });
                }
                Ok(JobInput::Mixed(inputs))
            }
            other => Err(RunError::Validation(format!(
                "unsupported job input: {other}"
            ))),
        }
    }
}

/// Apply run-wide options to a task.
fn apply_options(task: &mut Task, options: &RunOptions) {
    if let Some(kind) = options.scheduler {
        task.scheduler.kind = kind;
    }
    if task.database.is_none() {
        task.database = options.database.clone();
    }
    if options.force_recompute {
        task.force_recompute = true;
    }
}

/// Options may change the scheduler, so a carried-over hash is dropped
/// and recomputed from the tasks on first use.
fn prepare_job(mut job: Job, options: &RunOptions) -> Result<Job> {
    for task in &mut job.tasks {
        apply_options(task, options);
    }
    job.validate()?;
    job.hash = None;
    Ok(job)
}

fn job_of(mut tasks: Vec<Task>, options: &RunOptions) -> Result<Job> {
    for task in &mut tasks {
        apply_options(task, options);
    }
    Job::new(tasks)
}

/// Turn any input into jobs in input order. Fails before any I/O other
/// than store lookups when the input is invalid.
pub async fn normalize(
    input: JobInput,
    options: &RunOptions,
    stores: &StoreRegistry,
) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    let mut pending = vec![input];
    // depth-first, reversed so the output keeps input order
    while let Some(input) = pending.pop() {
        match input {
            JobInput::Task(task) => jobs.push(job_of(vec![task], options)?),
            JobInput::Tasks(tasks) => {
                for task in tasks {
                    jobs.push(job_of(vec![task], options)?);
                }
            }
            JobInput::Batch(batch) => {
                for tasks in batch.jobs {
                    jobs.push(job_of(tasks, options)?);
                }
            }
            JobInput::Job(job) => jobs.push(prepare_job(job, options)?),
            JobInput::Record(value) => jobs.push(prepare_job(Job::from_value(value)?, options)?),
            JobInput::StoreId(id) => {
                let store = stores.open(options.database.as_deref()).await?;
                let Some(job) = store.get(&StoreKey::Id(id)).await? else {
                    return Err(RunError::JobNotFound(format!(
                        "id {id} in {}",
                        store.identity()
                    )));
                };
                jobs.push(prepare_job(job, options)?);
            }
            JobInput::Mixed(items) => pending.extend(items.into_iter().rev()),
        }
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_rejects_empty_jobs() {
        assert!(Batch::builder().job(vec![]).build().is_err());
        let batch = Batch::builder()
            .task(Task::new("a"))
            .job([Task::new("b"), Task::new("c")])
            .build()
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn json_depth_is_limited() {
        let ok = json!([{"program": "a"}, [{"program": "b"}, {"program": "c"}], 4]);
        assert!(JobInput::from_json(ok).is_ok());
        let deep = json!([[[{"program": "a"}]]]);
        assert!(matches!(
            JobInput::from_json(deep),
            Err(RunError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn carried_hash_is_recomputed_after_options() {
        let stores = StoreRegistry::new();
        let mut job = Job::new(vec![Task::new("xtb")]).unwrap();
        let local_hash = job.ensure_hash().unwrap();
        let options = RunOptions::default().with_scheduler(crate::config::SchedulerKind::Slurm);

        let mut jobs = normalize(JobInput::Job(job), &options, &stores).await.unwrap();
        let fresh = jobs[0].ensure_hash().unwrap();
        assert_ne!(fresh, local_hash);
        assert_eq!(fresh, jobs[0].compute_hash().unwrap());

        let record = json!({"tasks": [{"program": "xtb"}], "hash": "forged"});
        let mut jobs = normalize(JobInput::Record(record), &RunOptions::default(), &stores)
            .await
            .unwrap();
        let hash = jobs[0].ensure_hash().unwrap();
        assert_ne!(hash, "forged");
        assert_eq!(hash, jobs[0].compute_hash().unwrap());
    }

    #[test]
    fn object_with_tasks_is_a_record() {
        let input = JobInput::from_json(json!({"tasks": [{"program": "a"}]})).unwrap();
        assert!(matches!(input, JobInput::Record(_)));
        let input = JobInput::from_json(json!({"program": "a"})).unwrap();
        assert!(matches!(input, JobInput::Task(_)));
    }
}
