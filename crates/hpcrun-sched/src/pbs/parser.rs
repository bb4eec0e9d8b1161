//! Parsers for PBS command output.

use std::path::PathBuf;

use crate::error::{SchedError, SchedResult};
use crate::info::{JobInfo, parse_local_timestamp};
use crate::status::JobStatus;

/// `Exit_status` PBS Pro records when a running job is deleted (256 + SIGTERM).
pub const EXIT_DELETED: i32 = 271;

/// `Exit_status` PBS Pro records when a job is killed for exceeding its walltime.
pub const EXIT_WALLTIME: i32 = -29;

/// PBS job state.
///
/// PBS uses single-letter state codes:
/// - Q: Queued (waiting in queue)
/// - R: Running
/// - E: Exiting (job completing)
/// - H: Held
/// - W: Waiting (delayed start)
/// - S: Suspended
/// - T: Being moved to new location
/// - B: Array job has at least one subjob running
/// - C, F, X: Finished (Torque, PBS Pro, PBS Pro subjob)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PbsState {
    Queued,
    Running,
    Exiting,
    Held,
    Waiting,
    Suspended,
    Transit,
    ArrayRunning,
    /// Left the system; the outcome depends on the exit status.
    Finished,
    Unknown(String),
}

impl PbsState {
    /// Normalized status, using `exit_status` for finished jobs.
    pub fn to_status(&self, exit_status: Option<i32>) -> JobStatus {
        match self {
            PbsState::Queued
            | PbsState::Held
            | PbsState::Waiting
            | PbsState::Suspended
            | PbsState::Transit => JobStatus::Pending,
            PbsState::Running | PbsState::Exiting | PbsState::ArrayRunning => JobStatus::Running,
            PbsState::Finished => match exit_status {
                None | Some(0) => JobStatus::Completed,
                Some(EXIT_DELETED) => JobStatus::Cancelled,
                Some(EXIT_WALLTIME) => JobStatus::Timeout,
                Some(_) => JobStatus::Failed,
            },
            PbsState::Unknown(_) => JobStatus::Unknown,
        }
    }
}

/// Parse a PBS state code.
pub fn parse_pbs_state(state: &str) -> PbsState {
    match state.trim().to_uppercase().as_str() {
        "Q" | "QUEUED" => PbsState::Queued,
        "R" | "RUNNING" => PbsState::Running,
        "E" | "EXITING" => PbsState::Exiting,
        "H" | "HELD" => PbsState::Held,
        "W" | "WAITING" => PbsState::Waiting,
        "S" | "SUSPENDED" => PbsState::Suspended,
        "T" | "TRANSIT" => PbsState::Transit,
        "B" | "BEGUN" => PbsState::ArrayRunning,
        "C" | "F" | "X" | "COMPLETED" | "FINISHED" => PbsState::Finished,
        other => {
            tracing::warn!("Unmapped PBS state '{other}'");
            PbsState::Unknown(state.to_string())
        }
    }
}

/// One job record of `qstat -f`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbsJobInfo {
    /// PBS job ID (e.g., "12345.pbs-server" or "12345[3].pbs-server").
    pub job_id: String,
    pub name: String,
    /// `Job_Owner` without the submit host.
    pub owner: Option<String>,
    pub state: PbsState,
    pub queue: Option<String>,
    pub exit_status: Option<i32>,
    pub ncpus: Option<u32>,
    pub mem: Option<String>,
    pub ctime: Option<String>,
    pub stime: Option<String>,
    pub mtime: Option<String>,
    pub output_path: Option<String>,
    pub error_path: Option<String>,
    pub exec_host: Option<String>,
    pub array_index: Option<u32>,
}

impl PbsJobInfo {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            name: String::new(),
            owner: None,
            state: PbsState::Unknown(String::new()),
            queue: None,
            exit_status: None,
            ncpus: None,
            mem: None,
            ctime: None,
            stime: None,
            mtime: None,
            output_path: None,
            error_path: None,
            exec_host: None,
            array_index: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.to_status(self.exit_status)
    }

    fn set(&mut self, key: &str, value: &str) {
        match key {
            "Job_Name" => self.name = value.to_string(),
            "Job_Owner" => {
                self.owner = Some(value.split('@').next().unwrap_or(value).to_string());
            }
            "job_state" => self.state = parse_pbs_state(value),
            "queue" => self.queue = Some(value.to_string()),
            "Exit_status" => self.exit_status = value.parse().ok(),
            "Resource_List.ncpus" => self.ncpus = value.parse().ok(),
            "Resource_List.mem" => self.mem = Some(value.to_string()),
            "ctime" => self.ctime = Some(value.to_string()),
            "stime" => self.stime = Some(value.to_string()),
            "mtime" => self.mtime = Some(value.to_string()),
            "Output_Path" => self.output_path = Some(value.to_string()),
            "Error_Path" => self.error_path = Some(value.to_string()),
            "exec_host" => self.exec_host = Some(value.to_string()),
            "array_index" => self.array_index = value.parse().ok(),
            _ => {}
        }
    }

    /// Backend-neutral view of this record.
    pub fn to_job_info(&self) -> JobInfo {
        let status = self.status();
        let mut info = JobInfo::new(self.job_id.clone(), status);
        info.name = (!self.name.is_empty()).then(|| self.name.clone());
        info.user = self.owner.clone();
        info.queue = self.queue.clone();
        info.cpu = self.ncpus;
        info.memory = self.mem.clone();
        info.submit_time = self.ctime.as_deref().and_then(parse_local_timestamp);
        info.start_time = self.stime.as_deref().and_then(parse_local_timestamp);
        if status.is_terminal() {
            info.end_time = self.mtime.as_deref().and_then(parse_local_timestamp);
            info.exit_code = self.exit_status;
        }
        info.stdout_path = self.output_path.as_deref().map(strip_host);
        info.stderr_path = self.error_path.as_deref().map(strip_host);
        info.node = self
            .exec_host
            .as_deref()
            .and_then(|h| h.split('/').next())
            .map(str::to_string);
        info.array_task_id = self.array_index;
        info
    }
}

/// Parse qsub output to extract the job ID.
///
/// qsub output format varies by PBS implementation:
/// - PBS Pro: "12345.pbs-server", arrays "12345[].pbs-server"
/// - Torque: "12345.server.domain.com"
/// - OpenPBS: "12345.hostname"
pub fn parse_qsub_output(output: &str) -> SchedResult<String> {
    let trimmed = output.trim();
    let head = trimmed.split('.').next().unwrap_or_default();
    let number = head.strip_suffix("[]").unwrap_or(head);

    if !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit())
        && !trimmed.contains(char::is_whitespace)
    {
        return Ok(trimmed.to_string());
    }

    Err(SchedError::Submission {
        backend: "pbs".to_string(),
        message: format!("Unexpected qsub output: {trimmed}"),
    })
}

/// Parse `qstat -f` output into one record per job.
///
/// ```text
/// Job Id: 12345.pbs-server
///     Job_Name = my_job
///     job_state = R
///     queue = batch
///     Exit_status = 0
///     Output_Path = login1:/home/user/my_job.o12345
/// ```
///
/// Long values wrap onto tab-indented continuation lines.
pub fn parse_qstat_full_output(output: &str) -> Vec<PbsJobInfo> {
    let mut jobs: Vec<PbsJobInfo> = Vec::new();
    let mut pending: Option<(String, String)> = None;

    let flush = |jobs: &mut Vec<PbsJobInfo>, pending: &mut Option<(String, String)>| {
        if let (Some(job), Some((key, value))) = (jobs.last_mut(), pending.take()) {
            job.set(&key, &value);
        }
    };

    for raw in output.lines() {
        if raw.starts_with('\t') {
            if let Some((_, value)) = pending.as_mut() {
                value.push_str(raw.trim());
            }
            continue;
        }
        flush(&mut jobs, &mut pending);

        let line = raw.trim();
        if let Some(id) = line.strip_prefix("Job Id:") {
            jobs.push(PbsJobInfo::new(id.trim().to_string()));
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            pending = Some((key.trim().to_string(), value.trim().to_string()));
        }
    }
    flush(&mut jobs, &mut pending);
    jobs
}

/// Parse qdel's stderr to decide whether deletion was accepted.
pub fn parse_qdel_output(stderr: &str) -> SchedResult<()> {
    let stderr = stderr.trim();
    if stderr.contains("Unknown Job Id") || stderr.contains("does not exist") {
        return Err(SchedError::JobNotFound(stderr.to_string()));
    }

    if stderr.is_empty() || stderr.contains("being deleted") {
        return Ok(());
    }

    Err(SchedError::CommandFailed {
        command: "qdel".to_string(),
        message: stderr.to_string(),
    })
}

/// `host:/path` as PBS reports output paths, reduced to the path.
pub fn strip_host(value: &str) -> PathBuf {
    PathBuf::from(value.split_once(':').map(|(_, p)| p).unwrap_or(value))
}
