use std::path::PathBuf;
use std::time::Duration;

use crate::job::{ContainerConfig, Job, Script, Task};
use crate::script::{compose_command, script_file_name, shell_quote, substitute_job_hash};
use crate::transfer;

const DEFAULT_CONTAINER_EXECUTABLE: &str = "docker";
const DEFAULT_CONTAINER_WORK_DIR: &str = "/work";

/// One command per task, each runnable with `sh -c` in the task's directory.
pub fn render(job: &Job, hash: &str) -> Script {
    Script {
        name: script_file_name(),
        content: commands(job, hash).join("\n"),
        walltime: walltime(job),
    }
}

/// The shell command of every task, in order. A command may span several
/// lines when an argument does.
pub fn commands(job: &Job, hash: &str) -> Vec<String> {
    job.tasks
        .iter()
        .enumerate()
        .map(|(i, task)| {
            let line = command_line(task, &transfer::resolve(task, i, hash));
            substitute_job_hash(&line, hash)
        })
        .collect()
}

/// Tasks may run side by side, so the longest budget bounds the job.
pub fn walltime(job: &Job) -> Duration {
    job.tasks
        .iter()
        .map(|t| t.job_time)
        .max()
        .unwrap_or(Duration::ZERO)
}

/// Shell line for a task. Output streams are captured by the caller.
pub fn command_line(task: &Task, files: &transfer::TaskFiles) -> String {
    let mut words: Vec<String> = launcher(task).iter().map(|w| shell_quote(w)).collect();
    words.push(shell_quote(&task.program));
    words.extend(task.args.iter().map(|a| shell_quote(a)));
    let mut main = words.join(" ");
    if let Some(stdin) = &files.stdin {
        main.push_str(" < ");
        main.push_str(&shell_quote(&stdin.path.to_string_lossy()));
    }
    compose_command(&task.pre_cmd, &main, &task.post_cmd)
}

/// Container prefix, then the custom launcher, then the conda prefix.
pub fn launcher(task: &Task) -> Vec<String> {
    let mut words = match &task.container {
        Some(container) => container_launcher(task, container),
        None => Vec::new(),
    };
    words.extend(task.launcher.iter().cloned());
    if let Some(env) = &task.conda_env {
        // an explicit conda prefix already in the launcher wins
        if !words.iter().any(|w| w == "conda") {
            words.extend(["conda", "run", "-n"].map(String::from));
            words.push(env.clone());
        }
    }
    words
}

fn container_launcher(task: &Task, container: &ContainerConfig) -> Vec<String> {
    let cpus = task.resources.cpus_per_task.max(1);
    let mut words: Vec<String> = vec![
        container
            .executable
            .clone()
            .unwrap_or_else(|| DEFAULT_CONTAINER_EXECUTABLE.to_string()),
        "run".into(),
        "-a".into(),
        "stdout".into(),
        "-a".into(),
        "stderr".into(),
        "--rm".into(),
        "--cpus".into(),
        cpus.to_string(),
    ];
    for (key, value) in &task.env {
        words.push("--env".into());
        words.push(format!("{key}={value}"));
    }
    if cpus > 1 {
        words.push("--env".into());
        words.push(format!("OMP_NUM_THREADS={cpus}"));
    }
    for (host, guest) in &container.mounts {
        words.push(format!("-v{host}:{guest}"));
    }
    let work_dir = container
        .work_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTAINER_WORK_DIR));
    words.push(format!("-w{}", work_dir.display()));
    words.push(container.image.clone());
    words
}
