use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConnectionConfig, Resources, SchedulerConfig, LOCALHOST};

const DEFAULT_JOB_TIME_SECS: u64 = 3600;

/// A file produced from inline content before a job is staged.
///
/// `${name}` and `$name` occurrences in `content` are replaced by the
/// matching entry of `variables`; unknown placeholders are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub name: String,
    #[serde(default)]
    pub folder: Option<PathBuf>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl FileSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder: None,
            content: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Content with template variables substituted.
    pub fn rendered_content(&self) -> String {
        let content = self.content.as_deref().unwrap_or_default();
        substitute_variables(content, &self.variables)
    }
}

/// Safe `$var` / `${var}` substitution. Unknown names and a lone `$` pass through.
pub fn substitute_variables(template: &str, variables: &BTreeMap<String, String>) -> String {
    if variables.is_empty() {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let key = &braced[..end];
                if let Some(value) = variables.get(key) {
                    out.push_str(value);
                    rest = &braced[end + 1..];
                    continue;
                }
            }
            out.push('$');
            rest = after;
            continue;
        }
        let ident_len = if after.starts_with(|c: char| c.is_ascii_digit()) {
            0
        } else {
            after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len())
        };
        let key = &after[..ident_len];
        match variables.get(key) {
            Some(value) if !key.is_empty() => {
                out.push_str(value);
                rest = &after[ident_len..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Container invocation wrapped around the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    /// Defaults to `docker`
    #[serde(default)]
    pub executable: Option<String>,
    /// host path -> container path
    #[serde(default)]
    pub mounts: BTreeMap<String, String>,
    /// Defaults to `/work`
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub name: Option<String>,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Prefix placed in front of the program, e.g. `mpirun -np 4`
    #[serde(default)]
    pub launcher: Vec<String>,
    #[serde(default)]
    pub pre_cmd: Vec<String>,
    #[serde(default)]
    pub post_cmd: Vec<String>,
    /// Environment modules loaded before a batch task runs
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub conda_env: Option<String>,
    #[serde(default)]
    pub container: Option<ContainerConfig>,

    #[serde(default)]
    pub work_dir_local: Option<PathBuf>,
    /// May contain the `{job_id}` placeholder
    #[serde(default)]
    pub work_dir_remote: Option<PathBuf>,
    #[serde(default)]
    pub submit_dir_local: Option<PathBuf>,
    #[serde(default)]
    pub submit_dir_remote: Option<PathBuf>,
    #[serde(default)]
    pub data_dir_remote: Option<PathBuf>,
    /// Read-only files already present in `data_dir_remote`
    #[serde(default)]
    pub data_files: Vec<PathBuf>,
    #[serde(default)]
    pub create_symlinks: bool,

    #[serde(default)]
    pub files_to_write: Vec<FileSpec>,
    /// Existing local files staged next to the written ones
    #[serde(default)]
    pub files_to_send: Vec<PathBuf>,
    #[serde(default)]
    pub files_to_parse: Vec<String>,
    #[serde(default)]
    pub stdin_file: Option<String>,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub stdout_file: Option<String>,
    #[serde(default)]
    pub stderr_file: Option<String>,

    #[serde(default = "default_job_time", with = "secs")]
    pub job_time: Duration,
    #[serde(default, with = "opt_secs")]
    pub wait_time: Option<Duration>,
    #[serde(default)]
    pub force_recompute: bool,
    #[serde(default)]
    pub resources: Resources,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
    /// Store identity
    #[serde(default)]
    pub database: Option<String>,
}

fn default_job_time() -> Duration {
    Duration::from_secs(DEFAULT_JOB_TIME_SECS)
}

impl Task {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            name: None,
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            launcher: Vec::new(),
            pre_cmd: Vec::new(),
            post_cmd: Vec::new(),
            modules: Vec::new(),
            conda_env: None,
            container: None,
            work_dir_local: None,
            work_dir_remote: None,
            submit_dir_local: None,
            submit_dir_remote: None,
            data_dir_remote: None,
            data_files: Vec::new(),
            create_symlinks: false,
            files_to_write: Vec::new(),
            files_to_send: Vec::new(),
            files_to_parse: Vec::new(),
            stdin_file: None,
            output_file: None,
            stdout_file: None,
            stderr_file: None,
            job_time: default_job_time(),
            wait_time: None,
            force_recompute: false,
            resources: Resources::default(),
            scheduler: SchedulerConfig::default(),
            connection: None,
            database: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_launcher<I, S>(mut self, launcher: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launcher = launcher.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_work_dir_local(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir_local = Some(dir.into());
        self
    }

    pub fn with_work_dir_remote(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir_remote = Some(dir.into());
        self
    }

    pub fn with_submit_dir_remote(mut self, dir: impl Into<PathBuf>) -> Self {
        self.submit_dir_remote = Some(dir.into());
        self
    }

    pub fn with_file_to_write(mut self, file: FileSpec) -> Self {
        self.files_to_write.push(file);
        self
    }

    pub fn with_file_to_send(mut self, path: impl Into<PathBuf>) -> Self {
        self.files_to_send.push(path.into());
        self
    }

    pub fn with_stdin_file(mut self, name: impl Into<String>) -> Self {
        self.stdin_file = Some(name.into());
        self
    }

    pub fn with_output_file(mut self, name: impl Into<String>) -> Self {
        self.output_file = Some(name.into());
        self
    }

    pub fn with_stdout_file(mut self, name: impl Into<String>) -> Self {
        self.stdout_file = Some(name.into());
        self
    }

    pub fn with_stderr_file(mut self, name: impl Into<String>) -> Self {
        self.stderr_file = Some(name.into());
        self
    }

    pub fn with_job_time(mut self, job_time: Duration) -> Self {
        self.job_time = job_time;
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = Some(wait_time);
        self
    }

    pub fn with_force_recompute(mut self, force: bool) -> Self {
        self.force_recompute = force;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Name used in logs and generated file names.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.clone())
    }

    /// How long a caller waits for this task before returning it unfinished.
    pub fn wait_budget(&self) -> Duration {
        self.wait_time.unwrap_or(self.job_time)
    }

    pub fn host(&self) -> &str {
        self.connection
            .as_ref()
            .map(|c| c.host.as_str())
            .unwrap_or(LOCALHOST)
    }

    /// True when the task executes on a host other than this one.
    pub fn is_remote(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| !c.is_local())
    }
}

pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

pub(crate) mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
