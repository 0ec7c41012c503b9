//! Polling submitted jobs until they finish or the budget runs out.

use std::time::Duration;

use tokio::time::Instant;

use crate::job::Job;
use crate::scheduler::{ExecutionContext, Scheduler};

const MAX_BACKOFF_UNITS: u64 = 60;

/// Poll intervals in units: 1, 2, 4, ... capped at 60.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    current: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Iterator for Backoff {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.current = (self.current * 2).clamp(1, MAX_BACKOFF_UNITS);
        Some(self.current)
    }
}

/// What a wait call saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSummary {
    pub polls: usize,
    pub finished: usize,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// The largest wait budget of any task in `jobs`.
pub fn derive_timeout(jobs: &[Job]) -> Duration {
    jobs.iter()
        .map(Job::wait_budget)
        .max()
        .unwrap_or(Duration::ZERO)
}

/// Poll unfinished jobs with exponential backoff.
///
/// Returns once every job is terminal, `timeout` has elapsed, or the
/// context is cancelled. A zero timeout polls exactly once. Jobs still
/// running at the end are left as they are. Poll errors are logged and
/// the job is polled again on the next round.
pub async fn wait(
    jobs: &mut [Job],
    scheduler: &dyn Scheduler,
    ctx: &ExecutionContext,
    timeout: Duration,
    unit: Duration,
) -> WaitSummary {
    let start = Instant::now();
    let total = jobs.len();
    let mut backoff = Backoff::new();
    let mut polls = 0;

    loop {
        for job in jobs.iter_mut() {
            if scheduler.is_finished(job) {
                continue;
            }
            let before = job.status;
            match scheduler.get_status(job, ctx).await {
                Ok(_) if job.status != before => ctx.observer.on_status(&job.name, job.status),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(job = %job.name, job_id = ?job.id, error = %e, "Status poll failed");
                }
            }
        }
        polls += 1;

        let finished = jobs.iter().filter(|j| scheduler.is_finished(j)).count();
        let elapsed = start.elapsed();
        ctx.observer
            .on_poll(finished, total, elapsed.as_secs_f64());

        if finished == total || elapsed >= timeout {
            return WaitSummary {
                polls,
                finished,
                elapsed,
                cancelled: false,
            };
        }

        let step = unit * backoff.next().unwrap_or(MAX_BACKOFF_UNITS) as u32;
        let pause = step.min(timeout - elapsed);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = ctx.cancel.cancelled() => {
                tracing::warn!(finished, total, "Wait cancelled");
                return WaitSummary {
                    polls,
                    finished,
                    elapsed: start.elapsed(),
                    cancelled: true,
                };
            }
        }
    }
}
