use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, RunError};
use crate::job::{Job, Script, JOB_HASH_PLACEHOLDER, JOB_ID_PLACEHOLDER};
use crate::script::local::launcher;
use crate::script::slurm_time::format_walltime;
use crate::script::{script_file_name, shell_quote};
use crate::transfer::{self, TaskFiles};

const JOB_ID_VAR: &str = "${SLURM_JOB_ID}";
/// sbatch filename pattern for the job id
const JOB_ID_PATTERN: &str = "%j";

fn body_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace(JOB_ID_PLACEHOLDER, JOB_ID_VAR)
}

fn directive_path(path: &Path) -> String {
    path.display()
        .to_string()
        .replace(JOB_ID_PLACEHOLDER, JOB_ID_PATTERN)
}

/// Absolute and home-relative paths refer to staged copies inside the
/// scratch directory once the task runs.
fn rewrite_arg(arg: &str) -> String {
    if arg.starts_with('/') || arg.starts_with("~/") {
        if let Some(name) = Path::new(arg).file_name() {
            return format!("${{SCRATCH}}/{}", shell_quote(&name.to_string_lossy()));
        }
    }
    shell_quote(arg)
}

fn all_equal<T: PartialEq>(items: &[T]) -> bool {
    items.windows(2).all(|w| w[0] == w[1])
}

/// Wrap a script path in double quotes. `${SLURM_JOB_ID}` still expands.
fn quoted(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    out.push('"');
    for c in path.chars() {
        if matches!(c, '"' | '\\' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Render a batch script running every task of `job` in sequence.
pub fn render(job: &Job, hash: &str) -> Result<Script> {
    let walltime = job.total_job_time();
    let files: Vec<TaskFiles> = job
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| transfer::resolve(t, i, hash))
        .collect();

    let mut s = String::from("#!/bin/bash\n");
    write_directives(&mut s, job, walltime)
        .and_then(|()| write_tasks(&mut s, job, &files))
        .map_err(|e| RunError::Validation(format!("cannot render script for {}: {e}", job.name)))?;

    Ok(Script {
        name: script_file_name(),
        content: s,
        walltime,
    })
}

fn write_directives(s: &mut String, job: &Job, walltime: Duration) -> fmt::Result {
    let res = &job.tasks[0].resources;
    let (_, submit_remote) = transfer::submit_dirs(job);
    let submit = directive_path(&submit_remote.path);

    writeln!(s, "#SBATCH --job-name={}", job.name)?;
    writeln!(s, "#SBATCH --time={}", format_walltime(walltime))?;
    if let Some(mem) = &res.memory_per_cpu {
        writeln!(s, "#SBATCH --mem-per-cpu={mem}")?;
    }
    writeln!(s, "#SBATCH --cpus-per-task={}", res.cpus_per_task)?;
    writeln!(s, "#SBATCH --ntasks={}", res.ntasks)?;
    if let Some(account) = &res.account {
        writeln!(s, "#SBATCH --account={account}")?;
    }
    if let Some(partition) = &res.partition {
        writeln!(s, "#SBATCH --partition={partition}")?;
    }
    if let Some(qos) = &res.qos {
        writeln!(s, "#SBATCH --qos={qos}")?;
    }
    writeln!(s, "#SBATCH --output={submit}/job_{JOB_HASH_PLACEHOLDER}.out")?;
    writeln!(s, "#SBATCH --error={submit}/job_{JOB_HASH_PLACEHOLDER}.err")?;
    writeln!(s, "#SBATCH --acctg-freq=1")?;
    for extra in &res.extra {
        writeln!(s, "#SBATCH {}", extra.trim())?;
    }
    s.push_str("\nset -o errexit\n\nset -x\n\n");
    Ok(())
}

fn write_tasks(s: &mut String, job: &Job, files: &[TaskFiles]) -> fmt::Result {
    let modules: Vec<&Vec<String>> = job.tasks.iter().map(|t| &t.modules).collect();
    let shared_modules = all_equal(&modules);
    let envs: Vec<_> = job.tasks.iter().map(|t| &t.env).collect();
    let shared_env = all_equal(&envs);
    let final_dirs: BTreeSet<String> = files.iter().map(|f| body_path(&f.work_dir.path)).collect();
    let multiple_dirs = final_dirs.len() > 1;
    let multi_task = job.tasks.len() > 1;

    for (i, (task, f)) in job.tasks.iter().zip(files).enumerate() {
        if !task.modules.is_empty() && (i == 0 || !shared_modules) {
            s.push_str("# Load modules\nmodule purge\n");
            for module in &task.modules {
                writeln!(s, "module load {module}")?;
            }
            s.push('\n');
        }
        if !task.env.is_empty() && (i == 0 || !shared_env) {
            s.push_str("# Setup environment\n");
            for (key, value) in &task.env {
                writeln!(s, "export {key}={}", shell_quote(value))?;
            }
            s.push('\n');
        }

        let stage = body_path(&f.stage_dir.path);
        let final_dir = body_path(&f.work_dir.path);
        let scratch = if multi_task {
            format!("{stage}/{JOB_ID_VAR}/{i}")
        } else {
            format!("{stage}/{JOB_ID_VAR}")
        };
        let copy_back = multiple_dirs || scratch != final_dir;

        writeln!(s, "# Run task no. {i}")?;
        writeln!(s, "export SCRATCH={}", quoted(&scratch))?;
        s.push_str("mkdir -p \"${SCRATCH}\"\n");
        for input in &f.inputs {
            writeln!(s, "cp -f {}/{} \"${{SCRATCH}}\"", quoted(&stage), shell_quote(&input.name()))?;
        }
        s.push_str("cd \"${SCRATCH}\"\n");

        if !task.pre_cmd.is_empty() {
            s.push_str("\n# Pre processing\n");
            for cmd in &task.pre_cmd {
                writeln!(s, "{cmd}")?;
            }
        }

        let mut symlinks = Vec::new();
        if task.create_symlinks && !f.data_files.is_empty() {
            s.push_str("\n# Create symlinks\n");
            for data in &f.data_files {
                writeln!(s, "ln -s {} \"${{SCRATCH}}\"", quoted(&body_path(&data.path)))?;
                if let Some(name) = data.file_name() {
                    symlinks.push(name);
                }
            }
        }

        if copy_back {
            writeln!(s, "mkdir -p {}", quoted(&final_dir))?;
        }
        let mut words: Vec<String> = launcher(task).iter().map(|w| shell_quote(w)).collect();
        words.push(shell_quote(&task.program));
        words.extend(task.args.iter().map(|a| rewrite_arg(a)));
        let mut line = words.join(" ");
        if let Some(stdin) = &f.stdin {
            if let Some(name) = stdin.file_name() {
                write!(line, " < {}", shell_quote(&name))?;
            }
        }
        write!(
            line,
            " >> {} 2>> {}",
            quoted(&body_path(&f.stdout.path)),
            quoted(&body_path(&f.stderr.path))
        )?;
        writeln!(s, "{line}")?;

        for name in &symlinks {
            writeln!(s, "rm {}", shell_quote(name))?;
        }
        if copy_back {
            writeln!(s, "cp -rf \"${{SCRATCH}}\"/* {}", quoted(&final_dir))?;
        }

        if !task.post_cmd.is_empty() {
            s.push_str("\n# Post processing\n");
            for cmd in &task.post_cmd {
                writeln!(s, "{cmd}")?;
            }
        }
        s.push('\n');
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_absolute_args_into_scratch() {
        assert_eq!(rewrite_arg("/home/me/mol.xyz"), "${SCRATCH}/mol.xyz");
        assert_eq!(rewrite_arg("~/inputs/a b.inp"), "${SCRATCH}/'a b.inp'");
        assert_eq!(rewrite_arg("--opt"), "--opt");
    }

    #[test]
    fn quoting_keeps_variables_live() {
        assert_eq!(quoted("/my work/${SLURM_JOB_ID}"), "\"/my work/${SLURM_JOB_ID}\"");
        assert_eq!(quoted(r#"/a"b"#), r#""/a\"b""#);
    }

    #[test]
    fn job_id_placeholder_maps_per_context() {
        let p = Path::new("/cluster/w/{job_id}");
        assert_eq!(body_path(p), "/cluster/w/${SLURM_JOB_ID}");
        assert_eq!(directive_path(p), "/cluster/w/%j");
    }
}
