//! Poll loop timing under paused tokio time.


use std::time::Duration;

use batchrun::job::{Job, JobStatus};
use batchrun::scheduler::Scheduler;
use batchrun::wait::{self, derive_timeout};
use test_harness::{mock_context, remote_task, MockScheduler};

fn submitted_job(program: &str) -> Job {
    let mut job = Job::new(vec![remote_task(program, "hpc", std::path::Path::new("/tmp/w"))]).unwrap();
    job.id = Some(1);
    job.update_status(JobStatus::Submitted);
    job
}

#[tokio::test(start_paused = true)]
async fn test_polls_until_terminal_with_backoff() {
    let scheduler = MockScheduler::new([
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
    ]);
    let (ctx, _) = mock_context("hpc");
    let mut jobs = vec![submitted_job("xtb")];

    let summary = wait::wait(
        &mut jobs,
        &scheduler,
        &ctx,
        Duration::from_secs(600),
        Duration::from_secs(1),
    )
    .await;

    assert_eq!(summary.polls, 3);
    assert_eq!(summary.finished, 1);
    assert!(!summary.cancelled);
    // pauses of 1s then 2s between the three polls
    assert!(summary.elapsed >= Duration::from_secs(3));
    assert!(summary.elapsed < Duration::from_secs(4));
    assert_eq!(jobs[0].status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_polls_once() {
    let scheduler = MockScheduler::new([JobStatus::Running]);
    let (ctx, _) = mock_context("hpc");
    let mut jobs = vec![submitted_job("a"), submitted_job("b")];

    let summary = wait::wait(&mut jobs, &scheduler, &ctx, Duration::ZERO, Duration::from_secs(1)).await;

    assert_eq!(summary.polls, 1);
    assert_eq!(summary.finished, 0);
    assert_eq!(scheduler.status_calls(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Running));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_leaves_jobs_running() {
    let scheduler = MockScheduler::new([JobStatus::Running]);
    let (ctx, _) = mock_context("hpc");
    let mut jobs = vec![submitted_job("xtb")];

    let summary = wait::wait(
        &mut jobs,
        &scheduler,
        &ctx,
        Duration::from_secs(10),
        Duration::from_secs(1),
    )
    .await;

    // polls at 0, 1, 3, 7 and the clamped last one at 10
    assert_eq!(summary.polls, 5);
    assert_eq!(summary.finished, 0);
    assert!(summary.elapsed >= Duration::from_secs(10));
    assert!(!scheduler.is_finished(&jobs[0]));
}

#[tokio::test(start_paused = true)]
async fn test_finished_jobs_are_not_polled_again() {
    let scheduler = MockScheduler::new([JobStatus::Running]);
    let (ctx, _) = mock_context("hpc");
    let mut done = submitted_job("done");
    done.update_status(JobStatus::Completed);
    let mut jobs = vec![done, submitted_job("busy")];

    wait::wait(&mut jobs, &scheduler, &ctx, Duration::from_secs(3), Duration::from_secs(1)).await;

    // only the running job is asked, once per round
    assert_eq!(scheduler.status_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_waiting() {
    let scheduler = MockScheduler::new([JobStatus::Running]);
    let (ctx, _) = mock_context("hpc");
    let cancel = ctx.cancel.clone();
    let mut jobs = vec![submitted_job("xtb")];

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });
    let summary = wait::wait(
        &mut jobs,
        &scheduler,
        &ctx,
        Duration::from_secs(3600),
        Duration::from_secs(1),
    )
    .await;

    assert!(summary.cancelled);
    assert!(summary.elapsed < Duration::from_secs(3600));
    assert_eq!(jobs[0].status, JobStatus::Running);
}

#[test]
fn test_timeout_is_largest_task_budget() {
    let short = Job::new(vec![remote_task("a", "hpc", std::path::Path::new("/tmp"))
        .with_wait_time(Duration::from_secs(30))])
    .unwrap();
    let long = Job::new(vec![remote_task("b", "hpc", std::path::Path::new("/tmp"))
        .with_wait_time(Duration::from_secs(90))])
    .unwrap();
    assert_eq!(derive_timeout(&[short, long]), Duration::from_secs(90));
    assert_eq!(derive_timeout(&[]), Duration::ZERO);
}
