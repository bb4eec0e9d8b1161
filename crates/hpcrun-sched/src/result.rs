//! Handles to submitted jobs.
//!
//! A [`JobResult`] never owns its scheduler: it keeps a weak reference and
//! asks the scheduler for status, exit code and output paths every time they
//! are requested. Once the scheduler is dropped every query degrades to
//! [`JobStatus::Unknown`] or `None`.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use crate::array::{JobArray, task_id};
use crate::error::{SchedError, SchedResult};
use crate::job::Job;
use crate::scheduler::Scheduler;
use crate::status::{JobStatus, OutputStream};

/// Identifier reported for foreground (interactive) runs, which have no
/// pollable job in any batch system.
pub const INTERACTIVE_JOB_ID: &str = "interactive";

/// Polling behaviour of the `wait` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Delay between two status queries.
    pub poll_interval: Duration,
    /// Give up after this long. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: None,
        }
    }
}

impl WaitOptions {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn deadline(&self, started: Instant) -> Option<Instant> {
        self.timeout.map(|t| started + t)
    }
}

/// Handle to one submitted job (or one array task).
#[derive(Clone)]
pub struct JobResult {
    job_id: String,
    scheduler: Weak<dyn Scheduler>,
    scheduler_name: String,
    job: Arc<Job>,
    /// Terminal status, recorded the first time one is observed.
    terminal: Arc<OnceLock<JobStatus>>,
    /// Exit code known at submission time (interactive runs only).
    known_exit_code: Option<i32>,
    array_base: bool,
}

impl JobResult {
    pub(crate) fn new(job_id: String, scheduler: &Arc<dyn Scheduler>, job: Arc<Job>) -> Self {
        Self {
            job_id,
            scheduler_name: scheduler.name().to_string(),
            scheduler: Arc::downgrade(scheduler),
            job,
            terminal: Arc::new(OnceLock::new()),
            known_exit_code: None,
            array_base: false,
        }
    }

    /// Result of a foreground run that already finished with `exit_code`.
    pub(crate) fn interactive(scheduler: &Arc<dyn Scheduler>, job: Arc<Job>, exit_code: i32) -> Self {
        let status = if exit_code == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let result = Self {
            known_exit_code: Some(exit_code),
            ..Self::new(INTERACTIVE_JOB_ID.to_string(), scheduler, job)
        };
        let _ = result.terminal.set(status);
        result
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The job snapshot that was submitted.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Name of the scheduler that accepted the job.
    pub fn scheduler_name(&self) -> &str {
        &self.scheduler_name
    }

    pub fn is_interactive(&self) -> bool {
        self.job_id == INTERACTIVE_JOB_ID
    }

    /// Whether this handle stands for a whole array rather than one job.
    pub fn is_array(&self) -> bool {
        self.array_base
    }

    fn scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        let scheduler = self.scheduler.upgrade();
        if scheduler.is_none() {
            tracing::debug!(
                "scheduler '{}' for job {} is gone",
                self.scheduler_name,
                self.job_id
            );
        }
        scheduler
    }

    /// Current status, queried from the scheduler.
    pub async fn status(&self) -> JobStatus {
        if let Some(status) = self.terminal.get() {
            return *status;
        }
        let Some(scheduler) = self.scheduler() else {
            return JobStatus::Unknown;
        };
        let status = scheduler.get_status(&self.job_id).await;
        if status.is_terminal() {
            // A concurrent query may have won the race; the first value sticks.
            return *self.terminal.get_or_init(|| status);
        }
        status
    }

    /// Whether the job reached a terminal state.
    pub async fn is_complete(&self) -> bool {
        self.status().await.is_terminal()
    }

    /// Exit code, available once the job is terminal.
    pub async fn exit_code(&self) -> Option<i32> {
        if self.known_exit_code.is_some() {
            return self.known_exit_code;
        }
        self.scheduler()?.get_exit_code(&self.job_id).await
    }

    /// Where the given output stream is written.
    pub async fn output_path(&self, stream: OutputStream) -> Option<PathBuf> {
        if self.is_interactive() {
            return None;
        }
        self.scheduler()?.get_output_path(&self.job_id, stream).await
    }

    /// Contents of the given output stream, if the file can be read.
    pub async fn read_output(&self, stream: OutputStream) -> Option<String> {
        let path = self.output_path(stream).await?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::debug!("cannot read {}: {e}", path.display());
                None
            }
        }
    }

    /// Ask the scheduler to cancel the job.
    pub async fn cancel(&self) -> bool {
        if self.is_interactive() {
            return false;
        }
        match self.scheduler() {
            Some(scheduler) => scheduler.cancel(&self.job_id).await,
            None => false,
        }
    }

    /// Poll until the job is terminal.
    ///
    /// Dropping the returned future stops polling and leaves the job running.
    pub async fn wait(&self, options: WaitOptions) -> SchedResult<JobStatus> {
        let started = Instant::now();
        let deadline = options.deadline(started);
        loop {
            let status = self.status().await;
            if status.is_terminal() {
                return Ok(status);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SchedError::TimeoutExceeded {
                            job_id: self.job_id.clone(),
                            waited: now - started,
                        });
                    }
                    options.poll_interval.min(deadline - now)
                }
                None => options.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }
}

impl fmt::Debug for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobResult")
            .field("job_id", &self.job_id)
            .field("scheduler", &self.scheduler_name)
            .field("job", &self.job.name())
            .field("terminal", &self.terminal.get())
            .finish()
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.job_id)
    }
}

/// Handle to a submitted job array.
///
/// Every task is addressed as `"{base_id}_{index}"`, whatever the backend.
#[derive(Clone)]
pub struct ArrayJobResult {
    base_id: String,
    scheduler: Weak<dyn Scheduler>,
    scheduler_name: String,
    job: Arc<Job>,
    array: Arc<JobArray>,
}

impl ArrayJobResult {
    pub(crate) fn new(base_id: String, scheduler: &Arc<dyn Scheduler>, array: JobArray) -> Self {
        Self {
            base_id,
            scheduler_name: scheduler.name().to_string(),
            scheduler: Arc::downgrade(scheduler),
            job: Arc::new(array.job().clone()),
            array: Arc::new(array),
        }
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    pub fn array(&self) -> &JobArray {
        &self.array
    }

    pub fn scheduler_name(&self) -> &str {
        &self.scheduler_name
    }

    /// Identifiers of every task, in index order.
    pub fn task_ids(&self) -> Vec<String> {
        self.array
            .indices()
            .map(|i| task_id(&self.base_id, i))
            .collect()
    }

    /// Handle for the task at `index`, or `None` if the array has no such task.
    pub fn task(&self, index: u32) -> Option<JobResult> {
        self.array.contains(index).then(|| self.task_result(index))
    }

    /// Handles for every task, in index order.
    pub fn tasks(&self) -> Vec<JobResult> {
        self.array.indices().map(|i| self.task_result(i)).collect()
    }

    fn task_result(&self, index: u32) -> JobResult {
        JobResult {
            job_id: task_id(&self.base_id, index),
            scheduler: self.scheduler.clone(),
            scheduler_name: self.scheduler_name.clone(),
            job: Arc::clone(&self.job),
            terminal: Arc::new(OnceLock::new()),
            known_exit_code: None,
            array_base: false,
        }
    }

    /// A handle for the array as a whole, usable as a dependency.
    pub fn as_dependency(&self) -> JobResult {
        JobResult {
            job_id: self.base_id.clone(),
            scheduler: self.scheduler.clone(),
            scheduler_name: self.scheduler_name.clone(),
            job: Arc::clone(&self.job),
            terminal: Arc::new(OnceLock::new()),
            known_exit_code: None,
            array_base: true,
        }
    }

    /// Status of every task, in index order.
    pub async fn statuses(&self) -> Vec<(u32, JobStatus)> {
        let tasks = self.tasks();
        let statuses = join_all(tasks.iter().map(|t| t.status())).await;
        self.array.indices().zip(statuses).collect()
    }

    /// Cancel the whole array.
    pub async fn cancel(&self) -> bool {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.cancel(&self.base_id).await,
            None => false,
        }
    }

    /// Poll until every task is terminal and return their final statuses.
    pub async fn wait(&self, options: WaitOptions) -> SchedResult<Vec<(u32, JobStatus)>> {
        let started = Instant::now();
        let deadline = options.deadline(started);
        let tasks = self.tasks();
        loop {
            let statuses = join_all(tasks.iter().map(|t| t.status())).await;
            if statuses.iter().all(JobStatus::is_terminal) {
                return Ok(self.array.indices().zip(statuses).collect());
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SchedError::TimeoutExceeded {
                            job_id: self.base_id.clone(),
                            waited: now - started,
                        });
                    }
                    options.poll_interval.min(deadline - now)
                }
                None => options.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }
}

impl fmt::Debug for ArrayJobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayJobResult")
            .field("base_id", &self.base_id)
            .field("scheduler", &self.scheduler_name)
            .field("range", &self.array.range_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::array::JobArray;
    use crate::info::{JobFilter, JobInfo};

    /// Reports scripted statuses in order, repeating the last one.
    struct ScriptedStatus {
        statuses: Vec<JobStatus>,
        queries: AtomicUsize,
    }

    impl ScriptedStatus {
        fn new(statuses: Vec<JobStatus>) -> Arc<dyn Scheduler> {
            Arc::new(Self {
                statuses,
                queries: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Scheduler for ScriptedStatus {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate_script(&self, job: &Job, _array: Option<&JobArray>) -> SchedResult<String> {
            Ok(job.command().to_string())
        }

        fn build_submit_command(&self, _job: &Job) -> SchedResult<Vec<String>> {
            Ok(vec!["true".to_string()])
        }

        async fn submit_job(&self, _job: &Job) -> SchedResult<String> {
            Ok("1".to_string())
        }

        async fn submit_array_job(&self, _array: &JobArray) -> SchedResult<String> {
            Ok("2".to_string())
        }

        async fn run_interactive(&self, _job: &Job) -> SchedResult<i32> {
            Ok(0)
        }

        async fn cancel(&self, _job_id: &str) -> bool {
            true
        }

        async fn get_status(&self, _job_id: &str) -> JobStatus {
            let n = self.queries.fetch_add(1, Ordering::SeqCst);
            self.statuses[n.min(self.statuses.len() - 1)]
        }

        async fn get_exit_code(&self, _job_id: &str) -> Option<i32> {
            Some(0)
        }

        async fn get_output_path(&self, _job_id: &str, _stream: OutputStream) -> Option<PathBuf> {
            None
        }

        async fn list_active_jobs(&self, _filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
            Ok(Vec::new())
        }
    }

    fn job() -> Arc<Job> {
        Arc::new(Job::new("sleep 1").unwrap())
    }

    fn fast() -> WaitOptions {
        WaitOptions::default().with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_terminal_status_is_memoized() {
        let scheduler = ScriptedStatus::new(vec![
            JobStatus::Running,
            JobStatus::Failed,
            JobStatus::Unknown,
            JobStatus::Completed,
        ]);
        let result = JobResult::new("7".into(), &scheduler, job());

        assert_eq!(result.status().await, JobStatus::Running);
        assert_eq!(result.status().await, JobStatus::Failed);
        for _ in 0..3 {
            assert_eq!(result.status().await, JobStatus::Failed);
        }
        // Clones share the recorded terminal state.
        assert_eq!(result.clone().status().await, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_is_not_memoized() {
        let scheduler = ScriptedStatus::new(vec![JobStatus::Unknown, JobStatus::Completed]);
        let result = JobResult::new("7".into(), &scheduler, job());
        assert_eq!(result.status().await, JobStatus::Unknown);
        assert_eq!(result.status().await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_dropped_scheduler_degrades_to_unknown() {
        let scheduler = ScriptedStatus::new(vec![JobStatus::Running]);
        let result = JobResult::new("7".into(), &scheduler, job());
        drop(scheduler);

        assert_eq!(result.status().await, JobStatus::Unknown);
        assert_eq!(result.exit_code().await, None);
        assert!(!result.cancel().await);
    }

    #[tokio::test]
    async fn test_wait_until_terminal() {
        let scheduler = ScriptedStatus::new(vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
        ]);
        let result = JobResult::new("7".into(), &scheduler, job());
        assert_eq!(result.wait(fast()).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_timeout_is_distinct() {
        let scheduler = ScriptedStatus::new(vec![JobStatus::Running]);
        let result = JobResult::new("7".into(), &scheduler, job());
        let err = result
            .wait(fast().with_timeout(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::TimeoutExceeded { ref job_id, .. } if job_id == "7"));
    }

    #[tokio::test]
    async fn test_interactive_result() {
        let scheduler = ScriptedStatus::new(vec![JobStatus::Running]);
        let result = JobResult::interactive(&scheduler, job(), 3);
        assert!(result.is_interactive());
        assert_eq!(result.job_id(), INTERACTIVE_JOB_ID);
        assert_eq!(result.status().await, JobStatus::Failed);
        assert_eq!(result.exit_code().await, Some(3));
        assert!(!result.cancel().await);
    }

    #[tokio::test]
    async fn test_array_task_addressing() {
        let scheduler = ScriptedStatus::new(vec![JobStatus::Completed]);
        let array = JobArray::from_range(Job::new("echo").unwrap(), "1-10:3").unwrap();
        let result = ArrayJobResult::new("500".into(), &scheduler, array);

        assert_eq!(result.task_ids(), ["500_1", "500_4", "500_7", "500_10"]);
        assert_eq!(result.task(4).unwrap().job_id(), "500_4");
        assert!(result.task(5).is_none());
        assert!(result.as_dependency().is_array());

        let statuses = result.wait(fast()).await.unwrap();
        assert_eq!(statuses.len(), 4);
        assert!(statuses.iter().all(|(_, s)| *s == JobStatus::Completed));
    }
}
