//! Backend-neutral job descriptions for monitoring.

use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::JobStatus;

/// What a scheduler reports about one job.
///
/// Only the identifier and status are always known; everything else depends
/// on what the backend exposes for the job's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub name: Option<String>,
    pub user: Option<String>,
    pub status: JobStatus,
    pub queue: Option<String>,
    pub submit_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cpu: Option<u32>,
    pub memory: Option<String>,
    pub gpu: Option<u32>,
    pub exit_code: Option<i32>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub node: Option<String>,
    pub array_task_id: Option<u32>,
}

impl JobInfo {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            name: None,
            user: None,
            status,
            queue: None,
            submit_time: None,
            start_time: None,
            end_time: None,
            cpu: None,
            memory: None,
            gpu: None,
            exit_code: None,
            stdout_path: None,
            stderr_path: None,
            node: None,
            array_task_id: None,
        }
    }

    /// Queued, running, or not determinable.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Elapsed run time: start to end, or start to now while running.
    pub fn runtime(&self) -> Option<ChronoDuration> {
        let start = self.start_time?;
        let end = match self.end_time {
            Some(end) => end,
            None if self.status == JobStatus::Running => Utc::now(),
            None => return None,
        };
        Some(end - start)
    }

    /// Run time as `45s`, `12m`, `2h 15m` or `3d 4h`.
    pub fn runtime_display(&self) -> String {
        match self.runtime() {
            Some(runtime) => format_runtime(runtime.num_seconds().max(0)),
            None => "-".to_string(),
        }
    }

    /// Requested resources as `cpu/mem/NGPU`, e.g. `4/16G/1GPU`.
    pub fn resources_display(&self) -> String {
        let parts: Vec<String> = [
            self.cpu.map(|c| c.to_string()),
            self.memory.clone(),
            self.gpu.map(|g| format!("{g}GPU")),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            "-".to_string()
        } else {
            parts.join("/")
        }
    }
}

fn format_runtime(total_secs: i64) -> String {
    if total_secs < 60 {
        return format!("{total_secs}s");
    }
    let minutes = total_secs / 60;
    if minutes < 60 {
        return format!("{minutes}m");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h {}m", minutes % 60);
    }
    format!("{}d {}h", hours / 24, hours % 24)
}

/// Selection criteria for job listings. Unset fields match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub user: Option<String>,
    pub statuses: Option<Vec<JobStatus>>,
    pub queue: Option<String>,
    /// Finished at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Finished at or before this instant.
    pub until: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Maximum number of entries returned.
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            user: None,
            statuses: None,
            queue: None,
            since: None,
            until: None,
            exit_code: None,
            limit: 100,
        }
    }
}

impl JobFilter {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    /// Whether `info` satisfies every set criterion.
    pub fn matches(&self, info: &JobInfo) -> bool {
        if let Some(user) = &self.user {
            if info.user.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&info.status) {
                return false;
            }
        }
        if let Some(queue) = &self.queue {
            if info.queue.as_deref() != Some(queue.as_str()) {
                return false;
            }
        }
        if let Some(code) = self.exit_code {
            if info.exit_code != Some(code) {
                return false;
            }
        }
        let finished = info.end_time;
        if let Some(since) = self.since {
            if finished.is_some_and(|t| t < since) {
                return false;
            }
        }
        if let Some(until) = self.until {
            if finished.is_some_and(|t| t > until) {
                return false;
            }
        }
        true
    }

    /// Keep the matching entries, up to the limit.
    pub fn apply(&self, jobs: impl IntoIterator<Item = JobInfo>) -> Vec<JobInfo> {
        jobs.into_iter()
            .filter(|j| self.matches(j))
            .take(self.limit)
            .collect()
    }
}

/// Parse a scheduler timestamp in local time (`2024-03-01T12:00:00`,
/// `03/01/2024 12:00:00` or PBS's `Fri Mar  1 12:00:00 2024`).
/// Placeholders like `N/A`, `Unknown` or `None` give `None`.
pub(crate) fn parse_local_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let naive = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
        "%a %b %e %H:%M:%S %Y",
    ]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())?;
    naive
        .and_local_timezone(Local)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
}
