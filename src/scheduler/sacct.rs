//! Parsing of `sbatch` and `sacct` output.

use serde_json::Value;

use crate::error::{Result, RunError};
use crate::job::metadata::{parse_exit_code, parse_memory, parse_timestamp};
use crate::job::{JobMetadata, JobStatus};
use crate::script::slurm_time::parse_walltime_opt;

/// Accounting fields requested from `sacct`, in order.
pub const FIELDS: [&str; 18] = [
    "JobID",
    "State",
    "Submit",
    "Start",
    "End",
    "Elapsed",
    "TimeLimit",
    "CPUTime",
    "MaxRSS",
    "MaxVMSize",
    "MaxDiskRead",
    "MaxDiskWrite",
    "ReqCPUS",
    "AllocCPUS",
    "AllocNodes",
    "ReqMem",
    "NodeList",
    "ExitCode",
];

/// One accounting line: the job itself or one of its steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub metadata: JobMetadata,
}

/// `sacct` invocation for one job.
pub fn query_command(program: &str, job_id: u64) -> String {
    format!(
        "{program} -j {job_id} --units=K -p -o {}",
        FIELDS.join(",")
    )
}

/// Extract the job id from `sbatch --parsable` output (`1234` or
/// `1234;cluster`). Plain `Submitted batch job 1234` is accepted too.
pub fn parse_submit_output(stdout: &str) -> Result<u64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or_default();
    let token = line
        .split(';')
        .next()
        .and_then(|head| head.split_whitespace().last())
        .unwrap_or_default();
    token.parse::<u64>().map_err(|_| {
        RunError::Submission(format!("could not parse job id from sbatch output: {line:?}"))
    })
}

fn opt_string(v: &str) -> Option<String> {
    let v = v.trim();
    (!v.is_empty()).then(|| v.to_string())
}

fn opt_u32(v: &str) -> Option<u32> {
    v.trim().parse().ok()
}

/// Parse accounting output in either pipe-separated or JSON form.
///
/// An empty result means the job is not visible to accounting yet.
pub fn parse(output: &str) -> Result<Vec<AccountingRecord>> {
    let trimmed = output.trim_start();
    if trimmed.starts_with('{') {
        return parse_json(trimmed);
    }
    parse_pipe(output)
}

fn parse_pipe(output: &str) -> Result<Vec<AccountingRecord>> {
    let mut records = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.first().map(|f| f.trim()) == Some("JobID") {
            continue;
        }
        if fields.len() < FIELDS.len() {
            return Err(RunError::Parse(format!(
                "expected {} accounting fields, got {}: {line:?}",
                FIELDS.len(),
                fields.len()
            )));
        }
        let f = |i: usize| fields[i].trim();
        let metadata = JobMetadata {
            step_id: opt_string(f(0)),
            state: opt_string(f(1)),
            submit: parse_timestamp(f(2)),
            start: parse_timestamp(f(3)),
            end: parse_timestamp(f(4)),
            elapsed: parse_walltime_opt(f(5))?,
            time_limit: parse_walltime_opt(f(6))?,
            cpu_time: parse_walltime_opt(f(7))?,
            max_rss: parse_memory(f(8)),
            max_vm_size: parse_memory(f(9)),
            max_disk_read: parse_memory(f(10)),
            max_disk_write: parse_memory(f(11)),
            req_cpus: opt_u32(f(12)),
            alloc_cpus: opt_u32(f(13)),
            alloc_nodes: opt_u32(f(14)),
            req_mem: parse_memory(f(15)),
            node_list: opt_string(f(16)),
            exit_code: parse_exit_code(f(17)),
        };
        records.push(AccountingRecord {
            job_id: f(0).to_string(),
            status: JobStatus::from_backend_state(f(1)),
            metadata,
        });
    }
    Ok(records)
}

fn json_state(job: &Value) -> String {
    match job.pointer("/state/current") {
        Some(Value::Array(states)) => states
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => job
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn json_number(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        // newer releases wrap numbers as {"set": true, "number": N}
        Value::Object(map) => map.get("number").and_then(Value::as_i64),
        _ => None,
    }
}

fn parse_json(output: &str) -> Result<Vec<AccountingRecord>> {
    let doc: Value = serde_json::from_str(output)
        .map_err(|e| RunError::Parse(format!("invalid accounting JSON: {e}")))?;
    let Some(jobs) = doc.get("jobs").and_then(Value::as_array) else {
        return Err(RunError::Parse("accounting JSON has no jobs array".to_string()));
    };
    let mut records = Vec::new();
    for job in jobs {
        let Some(id) = json_number(job.get("job_id")) else {
            continue;
        };
        let state = json_state(job);
        let exit_code = json_number(job.pointer("/exit_code/return_code")).map(|n| n as i32);
        let metadata = JobMetadata {
            step_id: Some(id.to_string()),
            state: opt_string(&state),
            node_list: job.get("nodes").and_then(Value::as_str).map(String::from),
            exit_code,
            ..Default::default()
        };
        records.push(AccountingRecord {
            job_id: id.to_string(),
            status: JobStatus::from_backend_state(&state),
            metadata,
        });
    }
    Ok(records)
}

/// The job-level record, else the first one.
pub fn job_record(records: &[AccountingRecord], job_id: u64) -> Option<&AccountingRecord> {
    let id = job_id.to_string();
    records
        .iter()
        .find(|r| r.job_id == id)
        .or_else(|| records.first())
}

/// Record of task `index`: step `{id}.{index}`, falling back to the job line.
pub fn task_record(
    records: &[AccountingRecord],
    job_id: u64,
    index: usize,
) -> Option<&AccountingRecord> {
    let step = format!("{job_id}.{index}");
    records
        .iter()
        .find(|r| r.job_id == step)
        .or_else(|| job_record(records, job_id))
}
