use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::job::task::opt_secs;

/// Accounting record of one task, as reported by a batch backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Backend id of the step, e.g. `4021.0`
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub submit: Option<NaiveDateTime>,
    #[serde(default)]
    pub start: Option<NaiveDateTime>,
    #[serde(default)]
    pub end: Option<NaiveDateTime>,
    #[serde(default, with = "opt_secs")]
    pub elapsed: Option<Duration>,
    #[serde(default, with = "opt_secs")]
    pub time_limit: Option<Duration>,
    #[serde(default, with = "opt_secs")]
    pub cpu_time: Option<Duration>,
    /// Bytes
    #[serde(default)]
    pub max_rss: Option<u64>,
    #[serde(default)]
    pub max_vm_size: Option<u64>,
    #[serde(default)]
    pub max_disk_read: Option<u64>,
    #[serde(default)]
    pub max_disk_write: Option<u64>,
    #[serde(default)]
    pub req_cpus: Option<u32>,
    #[serde(default)]
    pub alloc_cpus: Option<u32>,
    #[serde(default)]
    pub alloc_nodes: Option<u32>,
    #[serde(default)]
    pub req_mem: Option<u64>,
    #[serde(default)]
    pub node_list: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Parse an accounting memory value (`1024K`, `3.5G`, `512`) into bytes.
///
/// Bare numbers are kibibytes, matching `--units=K`. Per-cpu and per-node
/// suffixes (`4000Mc`, `2Gn`) are accepted and ignored.
pub fn parse_memory(value: &str) -> Option<u64> {
    let v = value.trim().trim_end_matches(['c', 'n']);
    if v.is_empty() {
        return None;
    }
    let (number, unit) = match v.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&v[..i], c.to_ascii_uppercase()),
        _ => (v, 'K'),
    };
    let scale: f64 = match unit {
        'B' => 1.0,
        'K' => 1024.0,
        'M' => 1024.0 * 1024.0,
        'G' => 1024.0 * 1024.0 * 1024.0,
        'T' => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    let n: f64 = number.parse().ok()?;
    if n < 0.0 {
        return None;
    }
    Some((n * scale).round() as u64)
}

/// Parse an accounting timestamp. `Unknown`, `None` and empty yield `None`.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let v = value.trim();
    if v.is_empty() || v.eq_ignore_ascii_case("unknown") || v.eq_ignore_ascii_case("none") {
        return None;
    }
    NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S").ok()
}

/// Parse `rc:signal` exit codes; the signal part is dropped.
pub fn parse_exit_code(value: &str) -> Option<i32> {
    value.split(':').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_units() {
        assert_eq!(parse_memory("1024K"), Some(1024 * 1024));
        assert_eq!(parse_memory("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_memory("1.5G"), Some(1_610_612_736));
        assert_eq!(parse_memory("4000Mc"), Some(4000 * 1024 * 1024));
        assert_eq!(parse_memory("16"), Some(16 * 1024));
        assert_eq!(parse_memory(""), None);
        assert_eq!(parse_memory("lots"), None);
    }

    #[test]
    fn timestamps() {
        let ts = parse_timestamp("2024-03-01T10:20:30").unwrap();
        assert_eq!(ts.to_string(), "2024-03-01 10:20:30");
        assert_eq!(parse_timestamp("Unknown"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(parse_exit_code("0:0"), Some(0));
        assert_eq!(parse_exit_code("137:9"), Some(137));
        assert_eq!(parse_exit_code("x"), None);
    }
}
