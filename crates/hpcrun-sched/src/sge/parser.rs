//! Parsers for Grid Engine command output.

use std::path::PathBuf;

use rustc_hash::FxHashMap;

use crate::error::{SchedError, SchedResult};
use crate::info::{JobInfo, parse_local_timestamp};
use crate::status::{JobStatus, lookup_state};

/// Grid Engine state codes as shown by `qstat`.
pub const STATE_TABLE: &[(&str, JobStatus)] = &[
    ("r", JobStatus::Running),
    ("t", JobStatus::Running),
    ("Rr", JobStatus::Running),
    ("Rt", JobStatus::Running),
    ("qw", JobStatus::Pending),
    ("hqw", JobStatus::Pending),
    ("hRwq", JobStatus::Pending),
    ("s", JobStatus::Pending),
    ("ts", JobStatus::Pending),
    ("S", JobStatus::Pending),
    ("tS", JobStatus::Pending),
    ("T", JobStatus::Pending),
    ("tT", JobStatus::Pending),
    ("Eqw", JobStatus::Failed),
    ("dr", JobStatus::Cancelled),
    ("dt", JobStatus::Cancelled),
];

/// Map a `qstat` state code.
pub fn parse_state(raw: &str) -> JobStatus {
    let status = lookup_state(STATE_TABLE, raw);
    if status == JobStatus::Unknown && !raw.trim().is_empty() {
        tracing::warn!("Unmapped SGE state '{}'", raw.trim());
    }
    status
}

/// Parse `qsub` output into a job id.
///
/// Accepts `-terse` output (`12345`, or `12345.1-10:1` for arrays) and the
/// verbose `Your job 12345 ("name") has been submitted` form.
pub fn parse_qsub_output(output: &str) -> SchedResult<String> {
    let trimmed = output.trim();
    let candidate = ["Your job-array ", "Your job "]
        .iter()
        .find_map(|prefix| {
            trimmed
                .find(prefix)
                .map(|pos| &trimmed[pos + prefix.len()..])
        })
        .unwrap_or(trimmed);

    let id: String = candidate
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if id.is_empty() {
        return Err(SchedError::Submission {
            backend: "sge".to_string(),
            message: format!("Unexpected qsub output: {trimmed}"),
        });
    }
    Ok(id)
}

/// One row of the plain `qstat` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QstatRow {
    pub job_id: String,
    pub name: String,
    pub user: String,
    pub state: String,
    /// `submit/start at` column.
    pub timestamp: Option<String>,
    /// Queue instance, `all.q@node01` for running jobs.
    pub queue: Option<String>,
    pub slots: Option<u32>,
    /// Task list of array jobs, e.g. `1-10:1`, `4` or `1,3,5`.
    pub tasks: Option<String>,
}

impl QstatRow {
    /// Whether this row covers array task `index`. Rows without a task list
    /// cover every task of their job.
    pub fn covers_task(&self, index: u32) -> bool {
        match &self.tasks {
            Some(tasks) => task_list_contains(tasks, index),
            None => true,
        }
    }
}

/// Whether an SGE task list (`1-10:2`, `7`, `1,3,5`) contains `index`.
pub fn task_list_contains(tasks: &str, index: u32) -> bool {
    tasks.split(',').any(|part| {
        let (range, step) = match part.split_once(':') {
            Some((r, s)) => (r, s.parse::<u32>().unwrap_or(1).max(1)),
            None => (part, 1),
        };
        match range.split_once('-') {
            Some((start, end)) => match (start.parse::<u32>(), end.parse::<u32>()) {
                (Ok(start), Ok(end)) => {
                    index >= start && index <= end && (index - start) % step == 0
                }
                _ => false,
            },
            None => range.parse::<u32>() == Ok(index),
        }
    })
}

/// Parse the plain `qstat` table:
///
/// ```text
/// job-ID  prior   name  user  state submit/start at     queue        slots ja-task-ID
/// ---------------------------------------------------------------------------------
/// 12345   0.55500 myjob alice r     01/01/2024 10:00:00 all.q@node1  1
/// 12346   0.00000 sweep alice qw    01/01/2024 10:01:00              1     1-10:1
/// ```
pub fn parse_qstat_plain(output: &str) -> Vec<QstatRow> {
    let mut rows = Vec::new();
    let mut data_started = false;
    for line in output.lines() {
        if line.starts_with('-') {
            data_started = true;
            continue;
        }
        if !data_started {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }

        let timestamp = (parts.len() >= 7).then(|| format!("{} {}", parts[5], parts[6]));
        // Pending jobs have no queue column, so the slot count moves left.
        let (queue, slots, tasks) = match parts.get(7) {
            Some(field) if field.parse::<u32>().is_ok() => {
                (None, field.parse().ok(), parts.get(8))
            }
            Some(field) => (
                Some(field.to_string()),
                parts.get(8).and_then(|s| s.parse().ok()),
                parts.get(9),
            ),
            None => (None, None, None),
        };

        rows.push(QstatRow {
            job_id: parts[0].to_string(),
            name: parts[2].to_string(),
            user: parts[3].to_string(),
            state: parts[4].to_string(),
            timestamp,
            queue,
            slots,
            tasks: tasks.map(|t| t.to_string()),
        });
    }
    rows
}

/// A backend-neutral view of a `qstat` row.
pub fn job_info_from_row(row: &QstatRow) -> JobInfo {
    let status = parse_state(&row.state);
    let mut info = JobInfo::new(row.job_id.clone(), status);
    info.name = Some(row.name.clone());
    info.user = Some(row.user.clone());
    info.cpu = row.slots;
    let timestamp = row.timestamp.as_deref().and_then(parse_local_timestamp);
    if status == JobStatus::Running {
        info.start_time = timestamp;
    } else {
        info.submit_time = timestamp;
    }
    if let Some(queue) = &row.queue {
        let (queue, host) = queue.split_once('@').unwrap_or((queue.as_str(), ""));
        info.queue = Some(queue.to_string());
        info.node = (!host.is_empty()).then(|| host.to_string());
    }
    info.array_task_id = row.tasks.as_deref().and_then(|t| t.parse().ok());
    info
}

/// Parse `qacct -j` output into key/value pairs.
///
/// When the output holds several records (reruns, array tasks), the last
/// one wins.
pub fn parse_qacct_output(output: &str) -> FxHashMap<String, String> {
    let mut record = FxHashMap::default();
    for line in output.lines() {
        if line.starts_with('=') {
            record.clear();
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if !key.is_empty() {
                record.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    record
}

/// Final status from a `qacct` record.
pub fn qacct_status(record: &FxHashMap<String, String>) -> Option<JobStatus> {
    let failed = record
        .get("failed")
        .and_then(|f| f.split_whitespace().next())
        .unwrap_or("0");
    if failed != "0" {
        return Some(JobStatus::Failed);
    }
    let exit_status = qacct_exit_code(record)?;
    Some(if exit_status == 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    })
}

/// `exit_status` of a `qacct` record.
pub fn qacct_exit_code(record: &FxHashMap<String, String>) -> Option<i32> {
    record
        .get("exit_status")
        .and_then(|s| s.split_whitespace().next())
        .and_then(|s| s.parse().ok())
}

/// Key/value lines of `qstat -j` (`key:   value`).
pub fn parse_qstat_job(output: &str) -> FxHashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty() && !k.contains(char::is_whitespace))
        .collect()
}

/// Resolve an output path from `qstat -j` fields.
///
/// Path lists look like `NONE:node:/path/$JOB_NAME.o$JOB_ID`; the part after
/// the last `:` is the path, with the job's pseudo variables expanded.
pub fn output_path(
    fields: &FxHashMap<String, String>,
    key: &str,
    job_id: &str,
    task: Option<u32>,
) -> Option<PathBuf> {
    let list = fields.get(key)?;
    let raw = list.rsplit(':').next()?.trim();
    if raw.is_empty() {
        return None;
    }
    let job_name = fields.get("job_name").map(String::as_str).unwrap_or_default();
    let task = task.map(|t| t.to_string()).unwrap_or_else(|| "undefined".to_string());
    let path = raw
        .replace("$JOB_ID", job_id)
        .replace("$JOB_NAME", job_name)
        .replace("$TASK_ID", &task);
    Some(PathBuf::from(path))
}
