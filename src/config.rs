use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunError};

pub const LOCALHOST: &str = "localhost";

/// Execution backend families.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Local,
    Slurm,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Local => write!(f, "local"),
            SchedulerKind::Slurm => write!(f, "slurm"),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = RunError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            // conda and container launchers still execute through the local backend
            "local" | "conda" | "docker" | "singularity" => Ok(SchedulerKind::Local),
            "slurm" => Ok(SchedulerKind::Slurm),
            other => Err(RunError::Validation(format!(
                "Invalid scheduler: {other}. Available schedulers: local, conda, docker, singularity, slurm"
            ))),
        }
    }
}

/// Scheduler selection carried by every task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub kind: SchedulerKind,
}

impl SchedulerConfig {
    pub fn local() -> Self {
        Self {
            kind: SchedulerKind::Local,
        }
    }

    pub fn slurm() -> Self {
        Self {
            kind: SchedulerKind::Slurm,
        }
    }
}

/// Connection to an execution host.
///
/// Pure configuration: sessions are opened from it by a
/// [`SessionFactory`](crate::remote::SessionFactory) and never stored here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Private key passed to ssh with `-i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// ssh config file passed with `-F`
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    /// Attempts when establishing the session
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Establish the session when the group starts instead of on first use
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_auto_connect() -> bool {
    true
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            config_file: None,
            connect_timeout_secs: None,
            max_attempts: default_max_attempts(),
            auto_connect: default_auto_connect(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// `user@host` or `host`, as ssh and rsync expect it.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Identity used for hashing and grouping. Transfer knobs are excluded.
    pub fn identity(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.destination(), port),
            None => self.destination(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), LOCALHOST | "127.0.0.1" | "::1")
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RunError::Validation(
                "host must be specified in connection options".to_string(),
            ));
        }
        if matches!(self.user.as_deref(), Some(u) if u.trim().is_empty()) {
            return Err(RunError::Validation(
                "user must not be empty in connection options".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(RunError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batch resources requested for a job. Taken from the first task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default = "one")]
    pub cpus_per_task: u32,
    #[serde(default = "one")]
    pub ntasks: u32,
    #[serde(default)]
    pub memory_per_cpu: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,
    /// Raw directives appended verbatim after `#SBATCH`
    #[serde(default)]
    pub extra: Vec<String>,
}

fn one() -> u32 {
    1
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus_per_task: 1,
            ntasks: 1,
            memory_per_cpu: None,
            account: None,
            partition: None,
            qos: None,
            extra: Vec::new(),
        }
    }
}

/// How long the runner waits for submitted jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitMode {
    /// Return right after submission
    NoWait,
    /// Wait up to the largest task wait budget
    #[default]
    Derived,
    /// Wait up to an explicit timeout; zero polls exactly once
    Timeout(Duration),
}

/// Which remote files are copied back after a job finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPolicy {
    /// Only declared output, stdout and stderr files
    #[default]
    Declared,
    /// The whole remote working directory
    WorkDir,
}

/// Options accepted by the runner entry points.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Store identity used when tasks do not name one
    pub database: Option<String>,
    /// Overrides the scheduler of every task
    pub scheduler: Option<SchedulerKind>,
    pub wait: WaitMode,
    pub dry_run: bool,
    pub force_recompute: bool,
    pub fetch_policy: FetchPolicy,
    /// Upper bound on concurrently processed groups
    pub max_workers: usize,
    /// Length of one backoff unit
    pub poll_unit: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            database: None,
            scheduler: None,
            wait: WaitMode::Derived,
            dry_run: false,
            force_recompute: false,
            fetch_policy: FetchPolicy::Declared,
            max_workers: 4,
            poll_unit: Duration::from_secs(1),
        }
    }
}

impl RunOptions {
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_scheduler(mut self, kind: SchedulerKind) -> Self {
        self.scheduler = Some(kind);
        self
    }

    pub fn with_wait(mut self, wait: WaitMode) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_force_recompute(mut self, force: bool) -> Self {
        self.force_recompute = force;
        self
    }

    pub fn with_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_poll_unit(mut self, unit: Duration) -> Self {
        self.poll_unit = unit;
        self
    }
}

/// Commands and retry knobs of the SLURM backend.
#[derive(Debug, Clone)]
pub struct SlurmSettings {
    pub submit_command: String,
    pub status_command: String,
    pub cancel_command: String,
    /// Accounting queries issued while the job id is not yet visible
    pub status_attempts: u32,
    pub status_retry_delay: Duration,
}

impl Default for SlurmSettings {
    fn default() -> Self {
        Self {
            submit_command: "sbatch".to_string(),
            status_command: "sacct".to_string(),
            cancel_command: "scancel".to_string(),
            status_attempts: 5,
            status_retry_delay: Duration::from_secs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_kind_parses_launcher_aliases() {
        assert_eq!("local".parse::<SchedulerKind>().unwrap(), SchedulerKind::Local);
        assert_eq!("conda".parse::<SchedulerKind>().unwrap(), SchedulerKind::Local);
        assert_eq!("Docker".parse::<SchedulerKind>().unwrap(), SchedulerKind::Local);
        assert_eq!("slurm".parse::<SchedulerKind>().unwrap(), SchedulerKind::Slurm);
        assert!(matches!(
            "pbs".parse::<SchedulerKind>(),
            Err(RunError::Validation(_))
        ));
    }

    #[test]
    fn connection_identity_excludes_transfer_knobs() {
        let a = ConnectionConfig::new("saga.example.org")
            .with_user("alice")
            .with_port(2222);
        let b = a.clone().with_max_attempts(9);
        assert_eq!(a.identity(), "alice@saga.example.org:2222");
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.destination(), "alice@saga.example.org");
    }

    #[test]
    fn connection_without_user_uses_bare_host() {
        let c = ConnectionConfig::new("hpc");
        assert_eq!(c.destination(), "hpc");
        assert_eq!(c.identity(), "hpc");
        assert!(!c.is_local());
        assert!(ConnectionConfig::new("localhost").is_local());
    }

    #[test]
    fn connection_validation_rejects_empty_fields() {
        assert!(ConnectionConfig::new("").validate().is_err());
        assert!(ConnectionConfig::new("hpc").with_user("").validate().is_err());
        assert!(ConnectionConfig::new("hpc")
            .with_max_attempts(0)
            .validate()
            .is_err());
        assert!(ConnectionConfig::new("hpc").with_user("bob").validate().is_ok());
    }

    #[test]
    fn connection_defaults_from_json() {
        let c: ConnectionConfig = serde_json::from_str(r#"{"host": "hpc"}"#).unwrap();
        assert_eq!(c.max_attempts, 3);
        assert!(c.auto_connect);
        assert!(c.user.is_none());
    }

    #[test]
    fn resources_default() {
        let r = Resources::default();
        assert_eq!(r.cpus_per_task, 1);
        assert_eq!(r.ntasks, 1);
        assert!(r.account.is_none());
        assert!(r.extra.is_empty());
    }

    #[test]
    fn run_options_default() {
        let o = RunOptions::default();
        assert_eq!(o.wait, WaitMode::Derived);
        assert_eq!(o.fetch_policy, FetchPolicy::Declared);
        assert_eq!(o.max_workers, 4);
        assert_eq!(o.poll_unit, Duration::from_secs(1));
        assert!(!o.dry_run);
        assert!(!o.force_recompute);
    }

    #[test]
    fn run_options_builders() {
        let o = RunOptions::default()
            .with_database("jobs.json")
            .with_scheduler(SchedulerKind::Slurm)
            .with_wait(WaitMode::NoWait)
            .with_max_workers(0);
        assert_eq!(o.database.as_deref(), Some("jobs.json"));
        assert_eq!(o.scheduler, Some(SchedulerKind::Slurm));
        assert_eq!(o.wait, WaitMode::NoWait);
        assert_eq!(o.max_workers, 1);
    }

    #[test]
    fn slurm_settings_default() {
        let s = SlurmSettings::default();
        assert_eq!(s.submit_command, "sbatch");
        assert_eq!(s.status_command, "sacct");
        assert_eq!(s.cancel_command, "scancel");
        assert_eq!(s.status_attempts, 5);
    }
}
