//! Bookkeeping for processes started by the local backend.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, oneshot};

use crate::info::JobInfo;
use crate::status::{JobStatus, OutputStream};

/// Acknowledges a cancellation once the process is gone.
pub(crate) type Ack = oneshot::Sender<()>;

/// How a local job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The process exited; signals are reported as `128 + signal`.
    Exited(i32),
    /// Cancelled by the user.
    Cancelled,
    /// Never launched because its dependency gate failed.
    Skipped,
    /// Killed after exceeding its walltime.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessState {
    /// Waiting on dependencies or an array slot.
    Queued,
    Running,
    Finished(Outcome),
}

impl ProcessState {
    pub(crate) fn status(self) -> JobStatus {
        match self {
            ProcessState::Queued => JobStatus::Pending,
            ProcessState::Running => JobStatus::Running,
            ProcessState::Finished(Outcome::Exited(0)) => JobStatus::Completed,
            ProcessState::Finished(Outcome::Exited(_)) => JobStatus::Failed,
            ProcessState::Finished(Outcome::Cancelled | Outcome::Skipped) => JobStatus::Cancelled,
            ProcessState::Finished(Outcome::TimedOut) => JobStatus::Timeout,
        }
    }
}

/// One registered job.
#[derive(Debug)]
pub(crate) struct Entry {
    pub name: String,
    pub cpu: Option<u32>,
    pub mem: Option<String>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub array_task: Option<u32>,
    pub state: ProcessState,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    /// Taken by the first cancellation.
    pub cancel: Option<oneshot::Sender<Ack>>,
}

impl Entry {
    fn info(&self, job_id: &str) -> JobInfo {
        let mut info = JobInfo::new(job_id, self.state.status());
        info.name = Some(self.name.clone());
        info.user = std::env::var("USER").ok();
        info.queue = Some("local".to_string());
        info.submit_time = Some(self.submitted);
        info.start_time = self.started;
        info.end_time = self.ended;
        info.cpu = self.cpu;
        info.memory = self.mem.clone();
        info.exit_code = match self.state {
            ProcessState::Finished(Outcome::Exited(code)) => Some(code),
            _ => None,
        };
        info.stdout_path = Some(self.stdout.clone());
        info.stderr_path = Some(self.stderr.clone());
        info.node = Some("localhost".to_string());
        info.array_task_id = self.array_task;
        info
    }
}

/// Job id to process state, owned by one local scheduler.
///
/// Nothing is persisted: ids from an earlier process are unknown here.
/// Finished entries stay until removed with `remove_finished` or
/// `prune_finished`.
#[derive(Debug, Default)]
pub(crate) struct ProcessRegistry {
    entries: Mutex<FxHashMap<String, Entry>>,
}

impl ProcessRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert(&self, job_id: String, entry: Entry) {
        self.entries.lock().await.insert(job_id, entry);
    }

    /// Move a queued job to running. `false` if it was cancelled meanwhile.
    pub(crate) async fn mark_running(&self, job_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(job_id) {
            Some(entry) if entry.state == ProcessState::Queued => {
                entry.state = ProcessState::Running;
                entry.started = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record how a job ended. The first recorded outcome is kept.
    pub(crate) async fn finish(&self, job_id: &str, outcome: Outcome) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(job_id) {
            if !matches!(entry.state, ProcessState::Finished(_)) {
                entry.state = ProcessState::Finished(outcome);
                entry.ended = Some(Utc::now());
            }
            entry.cancel = None;
        }
    }

    /// Mark a job cancelled and signal its supervisor.
    ///
    /// Returns `false` for unknown or already finished jobs. When the job had
    /// a live process, waits up to `grace` for the supervisor to confirm it
    /// is gone.
    pub(crate) async fn cancel(&self, job_id: &str, grace: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(job_id) else {
                return false;
            };
            if matches!(entry.state, ProcessState::Finished(_)) {
                return false;
            }
            entry.state = ProcessState::Finished(Outcome::Cancelled);
            entry.ended = Some(Utc::now());
            match entry.cancel.take() {
                Some(signal) => {
                    if signal.send(ack_tx).is_err() {
                        return true;
                    }
                }
                None => return true,
            }
        }
        if tokio::time::timeout(grace, ack_rx).await.is_err() {
            tracing::warn!("Local job {job_id} did not confirm cancellation in {grace:?}");
        }
        true
    }

    /// Drop a finished job. Active jobs are kept and yield `false`.
    pub(crate) async fn remove_finished(&self, job_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(job_id) {
            Some(entry) if matches!(entry.state, ProcessState::Finished(_)) => {
                entries.remove(job_id);
                true
            }
            _ => false,
        }
    }

    /// Drop every finished job and return how many went.
    pub(crate) async fn prune_finished(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| !matches!(e.state, ProcessState::Finished(_)));
        before - entries.len()
    }

    /// Status of a single registered job.
    pub(crate) async fn status(&self, job_id: &str) -> Option<JobStatus> {
        let entries = self.entries.lock().await;
        entries.get(job_id).map(|e| e.state.status())
    }

    /// Statuses of the tasks registered under an array base id.
    pub(crate) async fn task_statuses(&self, base_id: &str) -> Vec<JobStatus> {
        let prefix = format!("{base_id}_");
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|(id, _)| id.starts_with(&prefix))
            .map(|(_, e)| e.state.status())
            .collect()
    }

    /// Ids of the tasks registered under an array base id.
    pub(crate) async fn task_ids(&self, base_id: &str) -> Vec<String> {
        let prefix = format!("{base_id}_");
        let entries = self.entries.lock().await;
        entries
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub(crate) async fn exit_code(&self, job_id: &str) -> Option<i32> {
        let entries = self.entries.lock().await;
        match entries.get(job_id)?.state {
            ProcessState::Finished(Outcome::Exited(code)) => Some(code),
            _ => None,
        }
    }

    pub(crate) async fn output_path(&self, job_id: &str, stream: OutputStream) -> Option<PathBuf> {
        let entries = self.entries.lock().await;
        let entry = entries.get(job_id)?;
        Some(match stream {
            OutputStream::Stdout => entry.stdout.clone(),
            OutputStream::Stderr => entry.stderr.clone(),
        })
    }

    pub(crate) async fn info(&self, job_id: &str) -> Option<JobInfo> {
        let entries = self.entries.lock().await;
        entries.get(job_id).map(|e| e.info(job_id))
    }

    /// Every registered job, oldest submission first.
    pub(crate) async fn snapshot(&self) -> Vec<JobInfo> {
        let entries = self.entries.lock().await;
        let mut jobs: Vec<JobInfo> = entries.iter().map(|(id, e)| e.info(id)).collect();
        jobs.sort_by(|a, b| a.submit_time.cmp(&b.submit_time).then(a.job_id.cmp(&b.job_id)));
        jobs
    }
}

/// One status for a simulated array.
///
/// Active while any task is active; otherwise failed if any task failed or
/// timed out, cancelled if any was cancelled, completed when all completed.
pub(crate) fn aggregate(statuses: &[JobStatus]) -> JobStatus {
    if statuses.is_empty() {
        return JobStatus::Unknown;
    }
    if statuses.contains(&JobStatus::Running) {
        return JobStatus::Running;
    }
    if statuses.iter().any(|s| s.is_active()) {
        return JobStatus::Pending;
    }
    [JobStatus::Failed, JobStatus::Timeout, JobStatus::Cancelled]
        .into_iter()
        .find(|s| statuses.contains(s))
        .unwrap_or(JobStatus::Completed)
}
