//! File resolution and movement between the local machine and execution hosts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{FetchPolicy, SchedulerKind, LOCALHOST};
use crate::error::{Result, RunError};
use crate::job::{Job, Output, ResolvedFile, Script, Task, JOB_ID_PLACEHOLDER};
use crate::scheduler::ExecutionContext;

/// An input staged before a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub local_path: PathBuf,
    /// Rendered content of a written file; `None` for files sent as they are
    pub content: Option<String>,
}

impl InputFile {
    pub fn name(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Every location a task touches, resolved before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFiles {
    pub host: String,
    pub local_dir: PathBuf,
    /// Final directory of the task on its host; may hold `{job_id}`
    pub work_dir: ResolvedFile,
    /// Directory inputs are uploaded to: `work_dir`, or its parent when the
    /// last component carries `{job_id}`
    pub stage_dir: ResolvedFile,
    pub inputs: Vec<InputFile>,
    pub data_files: Vec<ResolvedFile>,
    pub stdin: Option<ResolvedFile>,
    pub stdout: ResolvedFile,
    pub stderr: ResolvedFile,
    pub output: Option<ResolvedFile>,
    pub files_to_parse: Vec<ResolvedFile>,
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Resolve the files of task number `index` of a job with hash `hash`.
///
/// Pure: reads no files and only consults the current directory to
/// anchor relative local paths.
pub fn resolve(task: &Task, index: usize, hash: &str) -> TaskFiles {
    let host = if task.is_remote() {
        task.host().to_string()
    } else {
        LOCALHOST.to_string()
    };
    let local_dir = absolute(task.work_dir_local.as_deref().unwrap_or(Path::new(".")));
    let work_path = task
        .work_dir_remote
        .clone()
        .unwrap_or_else(|| local_dir.clone());
    let stage_path = match work_path.file_name() {
        Some(name) if name.to_string_lossy().contains(JOB_ID_PLACEHOLDER) => work_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| work_path.clone()),
        _ => work_path.clone(),
    };
    let at_work = |name: &str| ResolvedFile::new(work_path.join(name), host.clone());

    let mut inputs: Vec<InputFile> = task
        .files_to_write
        .iter()
        .map(|f| {
            let folder = f
                .folder
                .as_deref()
                .map(absolute)
                .unwrap_or_else(|| local_dir.clone());
            InputFile {
                local_path: folder.join(&f.name),
                content: Some(f.rendered_content()),
            }
        })
        .collect();
    inputs.extend(task.files_to_send.iter().map(|p| InputFile {
        local_path: if p.is_absolute() {
            p.clone()
        } else {
            local_dir.join(p)
        },
        content: None,
    }));

    let data_files = match &task.data_dir_remote {
        Some(dir) => task
            .data_files
            .iter()
            .map(|f| ResolvedFile::new(dir.join(f.file_name().unwrap_or(f.as_os_str())), host.clone()))
            .collect(),
        None => task
            .data_files
            .iter()
            .map(|f| ResolvedFile::new(f.clone(), host.clone()))
            .collect(),
    };

    let stdout_name = task
        .stdout_file
        .clone()
        .unwrap_or_else(|| format!("job_{hash}_{index}.out"));
    let stderr_name = task
        .stderr_file
        .clone()
        .unwrap_or_else(|| format!("job_{hash}_{index}.err"));

    TaskFiles {
        stdin: task
            .stdin_file
            .as_deref()
            .map(|name| ResolvedFile::new(stage_path.join(name), host.clone())),
        stdout: at_work(&stdout_name),
        stderr: at_work(&stderr_name),
        output: task.output_file.as_deref().map(at_work),
        files_to_parse: task.files_to_parse.iter().map(|n| at_work(n)).collect(),
        work_dir: ResolvedFile::new(work_path.clone(), host.clone()),
        stage_dir: ResolvedFile::new(stage_path.clone(), host.clone()),
        inputs,
        data_files,
        local_dir,
        host,
    }
}

/// Resolve every task and record the locations on the job's outputs.
pub fn resolve_job(job: &mut Job) -> Vec<TaskFiles> {
    let hash = job.hash.clone().unwrap_or_default();
    let files: Vec<TaskFiles> = job
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| resolve(t, i, &hash))
        .collect();
    if job.outputs.len() != job.tasks.len() {
        job.outputs = vec![Output::default(); job.tasks.len()];
    }
    for (output, f) in job.outputs.iter_mut().zip(&files) {
        output.output_file = f.output.clone();
        output.stdout = Some(f.stdout.clone());
        output.stderr = Some(f.stderr.clone());
        output.files_to_parse = f.files_to_parse.clone();
        output.output_folder = Some(f.work_dir.clone());
        output.local_folder = Some(f.local_dir.clone());
    }
    if let Some(id) = job.id {
        rebind_job_id(job, id);
    }
    files
}

/// Where the script is written locally and where it is submitted from.
pub fn submit_dirs(job: &Job) -> (PathBuf, ResolvedFile) {
    let first = &job.tasks[0];
    let files = resolve(first, 0, job.hash.as_deref().unwrap_or_default());
    let local = first
        .submit_dir_local
        .as_deref()
        .map(absolute)
        .unwrap_or_else(|| files.local_dir.clone());
    let remote = match &first.submit_dir_remote {
        Some(dir) => ResolvedFile::new(dir.clone(), files.host.clone()),
        None => files.stage_dir,
    };
    (local, remote)
}

/// Re-resolve `{job_id}` locations once the backend id is known.
pub fn rebind_job_id(job: &mut Job, id: u64) {
    job.bind_job_id(id);
}

/// Group uploads by destination so each (host, folder) is one call.
pub fn upload_batches(job: &Job) -> BTreeMap<(String, PathBuf), Vec<PathBuf>> {
    let hash = job.hash.clone().unwrap_or_default();
    let mut batches: BTreeMap<(String, PathBuf), Vec<PathBuf>> = BTreeMap::new();
    for (i, task) in job.tasks.iter().enumerate() {
        let files = resolve(task, i, &hash);
        let dest = (files.stage_dir.host.clone(), files.stage_dir.path.clone());
        for input in files.inputs {
            // written files already sit in the stage dir on a local run
            if files.host == LOCALHOST && input.local_path.parent() == Some(dest.1.as_path()) {
                continue;
            }
            let batch = batches.entry(dest.clone()).or_default();
            if !batch.contains(&input.local_path) {
                batch.push(input.local_path);
            }
        }
    }
    batches
}

/// Write inline files (and the script, for batch backends) locally.
pub async fn write_local_files(job: &Job) -> Result<Option<PathBuf>> {
    let hash = job.hash.clone().unwrap_or_default();
    for (i, task) in job.tasks.iter().enumerate() {
        for input in resolve(task, i, &hash).inputs {
            let Some(content) = input.content else {
                continue;
            };
            if let Some(parent) = input.local_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&input.local_path, content)
                .await
                .map_err(|e| {
                    RunError::Transfer(format!("write {}: {e}", input.local_path.display()))
                })?;
            tracing::debug!(file = %input.local_path.display(), "Wrote input file");
        }
    }
    match &job.script {
        Some(script) if job.scheduler_kind() != SchedulerKind::Local => {
            Ok(Some(write_script(job, script).await?))
        }
        _ => Ok(None),
    }
}

async fn write_script(job: &Job, script: &Script) -> Result<PathBuf> {
    let (local, _) = submit_dirs(job);
    tokio::fs::create_dir_all(&local).await?;
    let path = local.join(&script.name);
    tokio::fs::write(&path, &script.content).await?;
    Ok(path)
}

/// Write inputs locally and upload them, batched per destination.
pub async fn stage_in(job: &Job, ctx: &ExecutionContext) -> Result<()> {
    let script_path = write_local_files(job).await?;
    let mut batches = upload_batches(job);
    if let Some(path) = script_path {
        let (local, remote) = submit_dirs(job);
        if remote.host != LOCALHOST || remote.path != local {
            batches
                .entry((remote.host.clone(), remote.path.clone()))
                .or_default()
                .push(path);
        }
    }
    for ((host, folder), files) in batches {
        if files.is_empty() {
            continue;
        }
        tracing::info!(
            job = %job.name,
            host = %host,
            folder = %folder.display(),
            files = files.len(),
            "Uploading inputs"
        );
        ctx.session.upload(&files, &folder).await?;
    }
    Ok(())
}

/// Copy results home and point the outputs at local paths.
///
/// Files whose host matches the session host are fetched; files already
/// local are left in place.
pub async fn fetch_out(job: &mut Job, ctx: &ExecutionContext, policy: FetchPolicy) -> Result<()> {
    let session_host = ctx.session.host().to_string();
    let mut per_dest: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    let mut whole_dirs: Vec<(PathBuf, PathBuf)> = Vec::new();

    for (i, output) in job.outputs.iter().enumerate() {
        let Some(local_dir) = output
            .local_folder
            .clone()
            .or_else(|| job.tasks[i].work_dir_local.clone())
        else {
            continue;
        };
        let remote_files: Vec<PathBuf> = output
            .declared_files()
            .filter(|f| !f.is_local() && f.host == session_host)
            .map(|f| f.path.clone())
            .collect();
        if remote_files.is_empty() {
            continue;
        }
        match (policy, &output.output_folder) {
            (FetchPolicy::WorkDir, Some(folder)) if folder.host == session_host => {
                let pair = (folder.path.clone(), local_dir);
                if !whole_dirs.contains(&pair) {
                    whole_dirs.push(pair);
                }
            }
            _ => per_dest.entry(local_dir).or_default().extend(remote_files),
        }
    }

    for (dir, dest) in &whole_dirs {
        tracing::info!(job = %job.name, dir = %dir.display(), "Fetching working directory");
        ctx.session.download_dir(dir, dest).await?;
    }
    for (dest, files) in &per_dest {
        tracing::info!(job = %job.name, files = files.len(), dest = %dest.display(), "Fetching outputs");
        ctx.session.download(files, dest).await?;
    }

    for output in &mut job.outputs {
        let fetched = output.declared_files().any(|f| !f.is_local());
        if let (true, Some(local_dir)) = (fetched, output.local_folder.clone()) {
            output.relocate_to(&local_dir);
        }
    }
    Ok(())
}
