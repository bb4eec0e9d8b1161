//! The scheduler contract shared by every backend.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::array::JobArray;
use crate::error::{SchedError, SchedResult};
use crate::info::{JobFilter, JobInfo};
use crate::job::Job;
use crate::local::LocalConfig;
use crate::pbs::PbsConfig;
use crate::result::{ArrayJobResult, JobResult};
use crate::sge::SgeConfig;
use crate::slurm::SlurmConfig;
use crate::status::{JobStatus, OutputStream};

/// The built-in backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SLURM workload manager.
    Slurm,
    /// Sun/Son of/Univa Grid Engine.
    Sge,
    /// PBS Pro / OpenPBS.
    Pbs,
    /// Child processes on the current machine.
    Local,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Slurm,
        BackendKind::Sge,
        BackendKind::Pbs,
        BackendKind::Local,
    ];

    /// Stable scheduler name.
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Slurm => "slurm",
            BackendKind::Sge => "sge",
            BackendKind::Pbs => "pbs",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| SchedError::UnknownScheduler(s.to_string()))
    }
}

/// Trait for scheduler implementations.
///
/// Queries (`get_status`, `get_exit_code`, `get_output_path`) never fail:
/// anything the backend cannot answer comes back as [`JobStatus::Unknown`]
/// or `None`. Submission goes through [`SchedulerExt`], which wraps the
/// returned identifiers in result handles.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Stable backend name, e.g. `slurm`.
    fn name(&self) -> &str;

    /// Passthrough arguments of `job` that belong to this backend.
    fn scheduler_args<'a>(&self, job: &'a Job) -> &'a [String] {
        match self.name().parse::<BackendKind>() {
            Ok(kind) => job.backend_args().for_backend(kind),
            Err(_) => &[],
        }
    }

    /// Render the job script, with array directives when `array` is given.
    fn generate_script(&self, job: &Job, array: Option<&JobArray>) -> SchedResult<String>;

    /// The submission command line, without the script path.
    fn build_submit_command(&self, job: &Job) -> SchedResult<Vec<String>>;

    /// Submit a batch job and return its identifier.
    async fn submit_job(&self, job: &Job) -> SchedResult<String>;

    /// Submit an array and return its base identifier.
    async fn submit_array_job(&self, array: &JobArray) -> SchedResult<String>;

    /// Run the job in the foreground and return its exit code.
    async fn run_interactive(&self, job: &Job) -> SchedResult<i32>;

    /// Cancel a job. `false` when there was nothing to cancel.
    async fn cancel(&self, job_id: &str) -> bool;

    /// Current status of a job.
    async fn get_status(&self, job_id: &str) -> JobStatus;

    /// Exit code of a terminal job.
    async fn get_exit_code(&self, job_id: &str) -> Option<i32>;

    /// Location of a job's stdout or stderr file.
    async fn get_output_path(&self, job_id: &str, stream: OutputStream) -> Option<PathBuf>;

    /// Jobs currently queued or running.
    async fn list_active_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<JobInfo>>;

    /// Finished jobs from the backend's accounting records.
    async fn list_completed_jobs(&self, _filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
        Err(SchedError::unsupported(self.name(), "job accounting"))
    }

    /// Whether [`Scheduler::list_completed_jobs`] can return anything.
    async fn has_accounting(&self) -> bool {
        false
    }

    /// Everything known about one job.
    async fn get_job_details(&self, job_id: &str) -> SchedResult<JobInfo> {
        basic_job_details(self, job_id).await
    }
}

/// Job details assembled from the individual queries.
pub async fn basic_job_details<S>(scheduler: &S, job_id: &str) -> SchedResult<JobInfo>
where
    S: Scheduler + ?Sized,
{
    let status = scheduler.get_status(job_id).await;
    if status == JobStatus::Unknown {
        return Err(SchedError::JobNotFound(job_id.to_string()));
    }
    let mut info = JobInfo::new(job_id, status);
    info.exit_code = scheduler.get_exit_code(job_id).await;
    info.stdout_path = scheduler.get_output_path(job_id, OutputStream::Stdout).await;
    info.stderr_path = scheduler.get_output_path(job_id, OutputStream::Stderr).await;
    Ok(info)
}

/// Submission entry points returning result handles.
#[async_trait]
pub trait SchedulerExt {
    /// Submit `job`. Interactive submissions block until the foreground run ends.
    async fn submit(&self, job: &Job, interactive: bool) -> SchedResult<JobResult>;

    /// Submit a job array.
    async fn submit_array(&self, array: &JobArray) -> SchedResult<ArrayJobResult>;
}

#[async_trait]
impl SchedulerExt for Arc<dyn Scheduler> {
    async fn submit(&self, job: &Job, interactive: bool) -> SchedResult<JobResult> {
        let snapshot = Arc::new(job.clone());
        if interactive {
            let code = self.run_interactive(&snapshot).await?;
            tracing::info!("Interactive job '{}' exited with {}", job.name(), code);
            return Ok(JobResult::interactive(self, snapshot, code));
        }

        let job_id = self.submit_job(&snapshot).await?;
        tracing::info!("Submitted job '{}' to {} as {}", job.name(), self.name(), job_id);
        Ok(JobResult::new(job_id, self, snapshot))
    }

    async fn submit_array(&self, array: &JobArray) -> SchedResult<ArrayJobResult> {
        let base_id = self.submit_array_job(array).await?;
        tracing::info!(
            "Submitted array '{}' [{}] to {} as {}",
            array.job().name(),
            array.range_str(),
            self.name(),
            base_id
        );
        Ok(ArrayJobResult::new(base_id, self, array.clone()))
    }
}

/// Configuration shared by all built-in schedulers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// SLURM settings.
    pub slurm: SlurmConfig,

    /// Grid Engine settings.
    pub sge: SgeConfig,

    /// PBS settings.
    pub pbs: PbsConfig,

    /// Local backend settings.
    pub local: LocalConfig,

    /// Directory for transient job scripts.
    pub script_dir: PathBuf,

    /// Timeout for each scheduler CLI invocation, in seconds.
    pub command_timeout_secs: u64,

    /// Default status polling interval, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            slurm: SlurmConfig::default(),
            sge: SgeConfig::default(),
            pbs: PbsConfig::default(),
            local: LocalConfig::default(),
            script_dir: std::env::temp_dir(),
            command_timeout_secs: 60,
            poll_interval_secs: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
