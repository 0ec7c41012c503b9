//! Conversions between durations and batch-queue time strings.

use std::time::Duration;

use crate::error::{Result, RunError};

/// Format as `D-HH:MM:SS`.
pub fn format_walltime(d: Duration) -> String {
    let total = d.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{days}-{hours:02}:{minutes:02}:{seconds:02}")
}

/// Parse any of `D-H:M:S`, `D-H:M`, `D-H`, `H:M:S`, `M:S` or `M`.
///
/// Fractional seconds (`00:01.234` as printed for CPU time) are truncated.
pub fn parse_walltime(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || RunError::Parse(format!("invalid time string: {s:?}"));
    if s.is_empty() {
        return Err(invalid());
    }
    let (days, rest) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().map_err(|_| invalid())?, Some(rest)),
        None => (0, None),
    };
    let parse_int = |v: &str| -> Result<u64> {
        let whole = v.split('.').next().unwrap_or_default();
        whole.parse::<u64>().map_err(|_| invalid())
    };

    let (h, m, sec) = match rest {
        Some(rest) => {
            let parts: Vec<&str> = rest.split(':').collect();
            match parts.as_slice() {
                [h] => (parse_int(h)?, 0, 0),
                [h, m] => (parse_int(h)?, parse_int(m)?, 0),
                [h, m, sec] => (parse_int(h)?, parse_int(m)?, parse_int(sec)?),
                _ => return Err(invalid()),
            }
        }
        None => {
            let parts: Vec<&str> = s.split(':').collect();
            match parts.as_slice() {
                [m] => (0, parse_int(m)?, 0),
                [m, sec] => (0, parse_int(m)?, parse_int(sec)?),
                [h, m, sec] => (parse_int(h)?, parse_int(m)?, parse_int(sec)?),
                _ => return Err(invalid()),
            }
        }
    };
    [(days, 86_400), (h, 3600), (m, 60), (sec, 1)]
        .into_iter()
        .try_fold(0u64, |total, (value, scale)| {
            value.checked_mul(scale).and_then(|v| total.checked_add(v))
        })
        .map(Duration::from_secs)
        .ok_or_else(|| RunError::Parse(format!("time string out of range: {s:?}")))
}

/// Accounting time field. `UNLIMITED` and blank read as no value; anything
/// else must parse.
pub fn parse_walltime_opt(s: &str) -> Result<Option<Duration>> {
    match s.trim() {
        "" | "UNLIMITED" | "Partition_Limit" | "INVALID" => Ok(None),
        other => parse_walltime(other).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_days_and_padding() {
        assert_eq!(format_walltime(Duration::from_secs(3600)), "0-01:00:00");
        assert_eq!(format_walltime(Duration::from_secs(90_061)), "1-01:01:01");
        assert_eq!(format_walltime(Duration::ZERO), "0-00:00:00");
    }

    #[test]
    fn parses_every_layout() {
        assert_eq!(parse_walltime("1-02:03:04").unwrap().as_secs(), 93_784);
        assert_eq!(parse_walltime("1-02:03").unwrap().as_secs(), 93_780);
        assert_eq!(parse_walltime("1-02").unwrap().as_secs(), 93_600);
        assert_eq!(parse_walltime("02:03:04").unwrap().as_secs(), 7384);
        assert_eq!(parse_walltime("03:04").unwrap().as_secs(), 184);
        assert_eq!(parse_walltime("5").unwrap().as_secs(), 300);
        assert_eq!(parse_walltime("00:01.234").unwrap().as_secs(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_walltime("").is_err());
        assert!(parse_walltime("a:b").is_err());
        assert!(parse_walltime("1:2:3:4").is_err());
        assert_eq!(parse_walltime_opt("UNLIMITED").unwrap(), None);
        assert!(parse_walltime_opt("soon").is_err());
    }

    #[test]
    fn out_of_range_is_a_parse_error() {
        assert!(matches!(
            parse_walltime("99999999999999999-00:00:00"),
            Err(RunError::Parse(_))
        ));
        assert!(matches!(
            parse_walltime(&format!("{}:00:00", u64::MAX / 1000)),
            Err(RunError::Parse(_))
        ));
    }
}
