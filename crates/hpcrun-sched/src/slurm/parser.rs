//! Parsers for SLURM command output.

use std::path::PathBuf;

use rustc_hash::FxHashMap;

use crate::array::split_task_id;
use crate::error::{SchedError, SchedResult};
use crate::info::{JobInfo, parse_local_timestamp};
use crate::status::{JobStatus, lookup_state};

/// SLURM job states, long and short forms.
pub const STATE_TABLE: &[(&str, JobStatus)] = &[
    ("PENDING", JobStatus::Pending),
    ("PD", JobStatus::Pending),
    ("CONFIGURING", JobStatus::Pending),
    ("CF", JobStatus::Pending),
    ("REQUEUED", JobStatus::Pending),
    ("RQ", JobStatus::Pending),
    ("SUSPENDED", JobStatus::Pending),
    ("S", JobStatus::Pending),
    ("RUNNING", JobStatus::Running),
    ("R", JobStatus::Running),
    ("COMPLETING", JobStatus::Running),
    ("CG", JobStatus::Running),
    ("STAGE_OUT", JobStatus::Running),
    ("SO", JobStatus::Running),
    ("COMPLETED", JobStatus::Completed),
    ("CD", JobStatus::Completed),
    ("FAILED", JobStatus::Failed),
    ("F", JobStatus::Failed),
    ("NODE_FAIL", JobStatus::Failed),
    ("NF", JobStatus::Failed),
    ("OUT_OF_MEMORY", JobStatus::Failed),
    ("OOM", JobStatus::Failed),
    ("BOOT_FAIL", JobStatus::Failed),
    ("BF", JobStatus::Failed),
    ("DEADLINE", JobStatus::Failed),
    ("DL", JobStatus::Failed),
    ("PREEMPTED", JobStatus::Failed),
    ("PR", JobStatus::Failed),
    ("CANCELLED", JobStatus::Cancelled),
    ("CA", JobStatus::Cancelled),
    ("TIMEOUT", JobStatus::Timeout),
    ("TO", JobStatus::Timeout),
];

/// Field list passed to `squeue -o` for listings.
pub const SQUEUE_FORMAT: &str = "%i|%j|%u|%T|%P|%V|%S|%C|%m|%N";

/// Field list passed to `sacct -o` for listings.
pub const SACCT_FIELDS: &str =
    "JobID,JobName,User,State,Partition,Submit,Start,End,AllocCPUS,ReqMem,ExitCode,NodeList";

/// Parse `sbatch --parsable` output (`12345` or `12345;cluster`).
///
/// The classic `Submitted batch job 12345` form is accepted as well.
pub fn parse_sbatch_output(output: &str) -> SchedResult<String> {
    let trimmed = output.trim();
    let candidate = match trimmed.strip_prefix("Submitted batch job ") {
        Some(rest) => rest.trim(),
        None => trimmed.split(';').next().unwrap_or_default().trim(),
    };

    if !candidate.is_empty() && candidate.chars().all(|c| c.is_ascii_digit()) {
        return Ok(candidate.to_string());
    }

    Err(SchedError::Submission {
        backend: "slurm".to_string(),
        message: format!("Unexpected sbatch output: {trimmed}"),
    })
}

/// Map one raw state token, tolerating `CANCELLED by 1000` and `CANCELLED+`.
pub fn parse_state(raw: &str) -> JobStatus {
    let token = raw.split_whitespace().next().unwrap_or_default();
    let token = token.trim_end_matches('+');
    let status = lookup_state(STATE_TABLE, token);
    if status == JobStatus::Unknown && !token.is_empty() {
        tracing::warn!("Unmapped SLURM state '{token}'");
    }
    status
}

/// State from `squeue -h -o %T`: one token per line, first line wins.
pub fn parse_squeue_state(output: &str) -> Option<JobStatus> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(parse_state(line))
}

/// State from `sacct -n -X -o State`: the first whitespace-delimited field.
pub fn parse_sacct_state(output: &str) -> Option<JobStatus> {
    let token = output.split_whitespace().next()?;
    Some(parse_state(token))
}

/// Exit code from a `code:signal` pair.
pub fn parse_exit_code(output: &str) -> Option<i32> {
    let pair = output.split_whitespace().next()?;
    pair.split(':').next()?.parse().ok()
}

/// `Key=Value` tokens of `scontrol show job`.
pub fn parse_scontrol(output: &str) -> FxHashMap<String, String> {
    output
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Output path from `scontrol show job` fields (`StdOut` or `StdErr`).
pub fn output_path(fields: &FxHashMap<String, String>, key: &str) -> Option<PathBuf> {
    fields
        .get(key)
        .filter(|v| !v.is_empty() && v.as_str() != "(null)")
        .map(PathBuf::from)
}

/// Job details from `scontrol show job` fields.
pub fn job_info_from_scontrol(job_id: &str, fields: &FxHashMap<String, String>) -> JobInfo {
    let get = |key: &str| fields.get(key).map(String::as_str);
    let status = get("JobState").map(parse_state).unwrap_or(JobStatus::Unknown);

    let mut info = JobInfo::new(job_id, status);
    info.name = get("JobName").map(str::to_string);
    info.user = get("UserId").map(|u| u.split('(').next().unwrap_or(u).to_string());
    info.queue = get("Partition").map(str::to_string);
    info.submit_time = get("SubmitTime").and_then(parse_local_timestamp);
    info.start_time = get("StartTime").and_then(parse_local_timestamp);
    info.end_time = get("EndTime").and_then(parse_local_timestamp);
    info.cpu = get("NumCPUs").and_then(|c| c.parse().ok());
    if let Some(tres) = get("ReqTRES") {
        for item in tres.split(',') {
            match item.split_once('=') {
                Some(("mem", mem)) => info.memory = Some(mem.to_string()),
                Some(("gres/gpu", gpu)) => info.gpu = gpu.parse().ok(),
                _ => {}
            }
        }
    }
    if status.is_terminal() {
        info.exit_code = get("ExitCode").and_then(parse_exit_code);
    }
    info.stdout_path = output_path(fields, "StdOut");
    info.stderr_path = output_path(fields, "StdErr");
    info.node = get("NodeList").filter(|n| *n != "(null)").map(str::to_string);
    info.array_task_id = get("ArrayTaskId").and_then(|t| t.parse().ok());
    info
}

fn field(parts: &[&str], index: usize) -> Option<String> {
    parts
        .get(index)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && !matches!(*s, "N/A" | "None" | "Unknown" | "(null)"))
        .map(str::to_string)
}

fn task_index(job_id: &str) -> Option<u32> {
    split_task_id(job_id).map(|(_, index)| index)
}

/// Rows of `squeue -h -o` with [`SQUEUE_FORMAT`].
pub fn parse_squeue_listing(output: &str) -> Vec<JobInfo> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() < 4 {
                return None;
            }
            let job_id = parts[0].trim();
            let mut info = JobInfo::new(job_id, parse_state(parts[3]));
            info.name = field(&parts, 1);
            info.user = field(&parts, 2);
            info.queue = field(&parts, 4);
            info.submit_time = field(&parts, 5).as_deref().and_then(parse_local_timestamp);
            info.start_time = field(&parts, 6).as_deref().and_then(parse_local_timestamp);
            info.cpu = field(&parts, 7).and_then(|c| c.parse().ok());
            info.memory = field(&parts, 8);
            info.node = field(&parts, 9);
            info.array_task_id = task_index(job_id);
            Some(info)
        })
        .collect()
}

/// Rows of `sacct -n -X -P -o` with [`SACCT_FIELDS`].
pub fn parse_sacct_listing(output: &str) -> Vec<JobInfo> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() < 11 {
                return None;
            }
            let job_id = parts[0].trim();
            // Job steps such as 123.batch are not jobs of their own.
            if job_id.contains('.') {
                return None;
            }
            let mut info = JobInfo::new(job_id, parse_state(parts[3]));
            info.name = field(&parts, 1);
            info.user = field(&parts, 2);
            info.queue = field(&parts, 4);
            info.submit_time = field(&parts, 5).as_deref().and_then(parse_local_timestamp);
            info.start_time = field(&parts, 6).as_deref().and_then(parse_local_timestamp);
            info.end_time = field(&parts, 7).as_deref().and_then(parse_local_timestamp);
            info.cpu = field(&parts, 8).and_then(|c| c.parse().ok());
            info.memory = field(&parts, 9);
            info.exit_code = field(&parts, 10).as_deref().and_then(parse_exit_code);
            info.node = field(&parts, 11);
            info.array_task_id = task_index(job_id);
            Some(info)
        })
        .collect()
}
