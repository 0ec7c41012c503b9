//! Local backend runs real subprocesses in temporary directories.

use std::time::Duration;

use batchrun::batch::Batch;
use batchrun::config::RunOptions;
use batchrun::job::{FileSpec, JobStatus, Task};
use batchrun::runner::Runner;

fn task_in(dir: &tempfile::TempDir, program: &str) -> Task {
    Task::new(program).with_work_dir_local(dir.path())
}

#[tokio::test]
async fn test_echo_writes_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let task = task_in(&dir, "echo")
        .with_args(["hi"])
        .with_stdout_file("out.txt");

    let results = Runner::new().run(task, &RunOptions::default()).await.unwrap();

    assert_eq!(results.len(), 1);
    let job = results[0].as_ref().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs.len(), 1);
    assert_eq!(job.outputs[0].returncode, Some(0));
    assert!(job.outputs[0].error.is_none());
    let stdout = job.outputs[0].stdout.as_ref().unwrap();
    assert_eq!(stdout.path, dir.path().join("out.txt"));
    let content = tokio::fs::read_to_string(&stdout.path).await.unwrap();
    assert!(content.contains("hi"));
}

#[tokio::test]
async fn test_multi_line_argument_runs_as_one_task() {
    let dir = tempfile::tempdir().unwrap();
    let task = task_in(&dir, "sh")
        .with_args(["-c", "echo a\necho b"])
        .with_stdout_file("lines.txt");

    let results = Runner::new().run(task, &RunOptions::default()).await.unwrap();

    let job = results[0].as_ref().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs.len(), 1);
    let content = tokio::fs::read_to_string(dir.path().join("lines.txt")).await.unwrap();
    assert_eq!(content, "a\nb\n");
}

#[tokio::test]
async fn test_nonzero_exit_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let task = task_in(&dir, "sh").with_args(["-c", "exit 3"]);

    let results = Runner::new().run(task, &RunOptions::default()).await.unwrap();

    let job = results[0].as_ref().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.outputs[0].returncode, Some(3));
    assert!(job.outputs[0].error.is_some());
}

#[tokio::test]
async fn test_stdin_and_env_reach_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let cat = task_in(&dir, "cat")
        .with_file_to_write(FileSpec::new("in.txt").with_content("from stdin"))
        .with_stdin_file("in.txt")
        .with_stdout_file("cat.out");
    let env = task_in(&dir, "sh")
        .with_args(["-c", "echo $GREETING"])
        .with_env("GREETING", "hello")
        .with_stdout_file("env.out");

    let results = Runner::new()
        .run(vec![cat, env], &RunOptions::default())
        .await
        .unwrap();

    assert!(results.iter().all(|r| r.as_ref().unwrap().is_success()));
    let cat_out = tokio::fs::read_to_string(dir.path().join("cat.out")).await.unwrap();
    assert_eq!(cat_out, "from stdin");
    let env_out = tokio::fs::read_to_string(dir.path().join("env.out")).await.unwrap();
    assert_eq!(env_out.trim(), "hello");
}

#[tokio::test]
async fn test_tasks_of_one_job_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let batch = Batch::builder()
        .job([
            task_in(&dir, "sh").with_args(["-c", "echo first >> log.txt"]),
            task_in(&dir, "sh").with_args(["-c", "echo second >> log.txt"]),
        ])
        .build()
        .unwrap();

    let results = Runner::new().run(batch, &RunOptions::default()).await.unwrap();

    let job = results[0].as_ref().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs.len(), 2);
    let log = tokio::fs::read_to_string(dir.path().join("log.txt")).await.unwrap();
    assert_eq!(log, "first\nsecond\n");
}

#[tokio::test]
async fn test_existing_outputs_skip_execution() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("result.txt"), "done").await.unwrap();
    let task = task_in(&dir, "false").with_output_file("result.txt");

    let runner = Runner::new();
    let results = runner.run(task.clone(), &RunOptions::default()).await.unwrap();
    assert_eq!(results[0].as_ref().unwrap().status, JobStatus::Completed);

    let forced = runner
        .run(task, &RunOptions::default().with_force_recompute(true))
        .await
        .unwrap();
    assert_eq!(forced[0].as_ref().unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_walltime_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let task = task_in(&dir, "sleep")
        .with_args(["5"])
        .with_job_time(Duration::from_millis(200));

    let results = Runner::new().run(task, &RunOptions::default()).await.unwrap();

    let job = results[0].as_ref().unwrap();
    assert_eq!(job.status, JobStatus::Timeout);
    assert!(job.outputs[0].error.is_some());
}

#[tokio::test]
async fn test_completed_local_job_comes_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let task = task_in(&dir, "sh")
        .with_args(["-c", "echo run >> runs.txt"]);
    let runner = Runner::new();

    runner.run(task.clone(), &RunOptions::default()).await.unwrap();
    let again = runner.run(task, &RunOptions::default()).await.unwrap();

    assert!(again[0].as_ref().unwrap().is_success());
    let runs = tokio::fs::read_to_string(dir.path().join("runs.txt")).await.unwrap();
    assert_eq!(runs.lines().count(), 1);
}
