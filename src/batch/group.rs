use std::collections::HashMap;

use crate::config::{ConnectionConfig, SchedulerKind};
use crate::job::Job;

/// Jobs sharing this key run on one session with one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub connection: String,
    pub scheduler: SchedulerKind,
}

impl GroupKey {
    pub fn of(job: &Job) -> Self {
        Self {
            connection: job.connection_identity(),
            scheduler: job.scheduler_kind(),
        }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scheduler, self.connection)
    }
}

/// Contiguous run of jobs with the same key.
#[derive(Debug, Clone)]
pub struct Group {
    pub key: GroupKey,
    /// Connection of the first job; identical for all by construction
    pub connection: Option<ConnectionConfig>,
    pub jobs: Vec<Job>,
    /// Input index of each job
    pub positions: Vec<usize>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Partition jobs into groups.
///
/// Groups appear in the order their key first occurs; inside a group
/// jobs keep their input order. Performs no I/O.
pub fn group(jobs: Vec<Job>) -> Vec<Group> {
    let mut rank: HashMap<GroupKey, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for (position, job) in jobs.into_iter().enumerate() {
        let key = GroupKey::of(&job);
        let next = rank.len();
        let index = *rank.entry(key.clone()).or_insert(next);
        if index == groups.len() {
            groups.push(Group {
                key,
                connection: job.connection().cloned(),
                jobs: Vec::new(),
                positions: Vec::new(),
            });
        }
        groups[index].jobs.push(job);
        groups[index].positions.push(position);
    }
    groups
}
