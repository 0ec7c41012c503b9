//! Submission script rendering for each backend.

pub mod local;
pub mod slurm;
pub mod slurm_time;

use crate::config::SchedulerKind;
use crate::error::Result;
use crate::job::{Job, Script, JOB_HASH_PLACEHOLDER};

/// Render the script for `job` on the backend its tasks name.
///
/// `{job_hash}` is substituted once the body is complete, so the hash
/// must already be set on the job.
pub fn render(job: &Job) -> Result<Script> {
    let hash = job.hash.clone().unwrap_or_else(|| "unhashed".to_string());
    let script = match job.scheduler_kind() {
        SchedulerKind::Local => local::render(job, &hash),
        SchedulerKind::Slurm => slurm::render(job, &hash)?,
    };
    Ok(Script {
        name: substitute_job_hash(&script.name, &hash),
        content: substitute_job_hash(&script.content, &hash),
        walltime: script.walltime,
    })
}

pub fn substitute_job_hash(s: &str, hash: &str) -> String {
    s.replace(JOB_HASH_PLACEHOLDER, hash)
}

pub(crate) fn script_file_name() -> String {
    format!("job_{JOB_HASH_PLACEHOLDER}.sh")
}

/// POSIX single-quote escaping; plain words are left as they are.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Join pre commands, the main command and post commands into one line.
///
/// Pre commands are sequenced with `;`, post commands only run when the
/// main command succeeds.
pub fn compose_command(pre: &[String], main: &str, post: &[String]) -> String {
    let clean = |cmds: &[String]| -> Vec<String> {
        cmds.iter()
            .flat_map(|c| c.lines())
            .map(|c| c.trim().trim_end_matches(';').trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    };
    let pre = clean(pre);
    let post = clean(post);

    let mut line = String::new();
    for cmd in &pre {
        line.push_str(cmd);
        line.push_str(" ; ");
    }
    line.push_str(main.trim());
    if !post.is_empty() {
        line.push_str(" && ");
        line.push_str(&post.join(" ; "));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("mol.xyz"), "mol.xyz");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn composes_pre_main_post() {
        let line = compose_command(
            &["module load xtb;".to_string(), "".to_string()],
            "xtb mol.xyz",
            &["gzip out".to_string(), "echo done".to_string()],
        );
        assert_eq!(line, "module load xtb ; xtb mol.xyz && gzip out ; echo done");
        assert_eq!(compose_command(&[], "true", &[]), "true");
    }

    #[test]
    fn multi_line_pre_commands_stay_on_one_line() {
        let line = compose_command(&["cd /tmp\nls".to_string()], "pwd", &[]);
        assert_eq!(line, "cd /tmp ; ls ; pwd");
    }
}
