//! Local adapter: runs jobs as child processes of the current program.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{Semaphore, oneshot};

use crate::array::{JobArray, task_id};
use crate::command::{CommandRunner, SystemRunner, args, exit_code_of};
use crate::dependency;
use crate::descriptor::parse_walltime_secs;
use crate::error::{SchedError, SchedResult};
use crate::info::{JobFilter, JobInfo};
use crate::job::{DependencyType, Job};
use crate::local::registry::{Ack, Entry, Outcome, ProcessRegistry, ProcessState, aggregate};
use crate::render::{BuiltinRenderer, ScriptContext, ScriptRenderer};
use crate::result::{JobResult, WaitOptions};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::status::{JobStatus, OutputStream};

/// Environment variable carrying the task index of a simulated array task.
pub const ARRAY_TASK_ENV: &str = "HPC_ARRAY_TASK_ID";

/// Variables kept when a job does not inherit the environment.
const BASE_ENV: [&str; 3] = ["PATH", "HOME", "USER"];

/// How long `cancel` waits for a killed process to be reaped.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for the local adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory for default stdout/stderr files and relative output paths.
    pub output_dir: PathBuf,

    /// Shell that runs the job script.
    pub shell: String,

    /// Polling interval while waiting on upstream jobs, in milliseconds.
    pub dependency_poll_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            shell: "bash".to_string(),
            dependency_poll_ms: 200,
        }
    }
}

/// Adapter that runs jobs on the local machine.
///
/// A job without dependencies starts during submission; a gated job gets a
/// supervisor task that waits for its dependencies and, for a throttled
/// array, a free slot. Started processes are not tied to the runtime and
/// keep running if it shuts down. Arrays are simulated with one process per
/// index.
pub struct LocalScheduler {
    config: LocalConfig,
    runner: Arc<dyn CommandRunner>,
    renderer: Arc<dyn ScriptRenderer>,
    registry: Arc<ProcessRegistry>,
}

/// Everything a supervisor needs to start one process.
struct Launch {
    job_id: String,
    shell: String,
    script: Arc<str>,
    stdout: PathBuf,
    stderr: PathBuf,
    inherit_env: bool,
    array_task: Option<u32>,
    walltime: Option<Duration>,
}

/// Conditions a queued job waits for before it starts.
struct Gate {
    dependency_type: DependencyType,
    upstream: Vec<JobResult>,
    poll: WaitOptions,
    slots: Option<Arc<Semaphore>>,
}

impl LocalScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner::new(config.command_timeout())))
    }

    /// Create an adapter whose foreground runs go through `runner`.
    pub fn with_runner(config: &SchedulerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config: config.local.clone(),
            runner,
            renderer: Arc::new(BuiltinRenderer),
            registry: Arc::new(ProcessRegistry::new()),
        }
    }

    /// Replace the script renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn ScriptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    fn next_id() -> String {
        format!("local-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Output file for `stream`: the job's own template, or `{name}.{id}.out|err`.
    fn output_file(&self, job: &Job, job_id: &str, stream: OutputStream) -> PathBuf {
        let template = match stream {
            OutputStream::Stdout => job.stdout(),
            OutputStream::Stderr => job.stderr(),
        };
        let file = match template {
            Some(t) => t.replace("%j", job_id).replace("%x", job.name()),
            None => {
                let ext = match stream {
                    OutputStream::Stdout => "out",
                    OutputStream::Stderr => "err",
                };
                format!("{}.{job_id}.{ext}", job.name())
            }
        };
        let path = Path::new(&file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.output_dir.join(path)
        }
    }

    fn gate(&self, job: &Job, slots: Option<Arc<Semaphore>>) -> Gate {
        Gate {
            dependency_type: job.dependency_type(),
            upstream: job.dependencies().to_vec(),
            poll: WaitOptions::default()
                .with_poll_interval(Duration::from_millis(self.config.dependency_poll_ms.max(10))),
            slots,
        }
    }

    /// Register one job and start it.
    ///
    /// A job with no dependencies and no array slot to wait for is spawned
    /// here, so its process exists before the submission returns. Anything
    /// else is queued behind a supervisor task that opens its gate first.
    async fn launch(&self, job: &Job, launch: Launch, gate: Gate) -> SchedResult<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let mut entry = Entry {
            name: job.name().to_string(),
            cpu: job.cpu(),
            mem: job.mem().map(str::to_string),
            stdout: launch.stdout.clone(),
            stderr: launch.stderr.clone(),
            array_task: launch.array_task,
            state: ProcessState::Queued,
            submitted: Utc::now(),
            started: None,
            ended: None,
            cancel: Some(cancel_tx),
        };

        if gate.upstream.is_empty() && gate.slots.is_none() {
            let child = spawn(&launch).await.map_err(|e| SchedError::Submission {
                backend: "local".to_string(),
                message: e.to_string(),
            })?;
            tracing::debug!("local job {} started as pid {:?}", launch.job_id, child.id());
            entry.state = ProcessState::Running;
            entry.started = Some(entry.submitted);
            self.registry.insert(launch.job_id.clone(), entry).await;
            tokio::spawn(monitor(self.registry.clone(), launch, child, cancel_rx));
        } else {
            self.registry.insert(launch.job_id.clone(), entry).await;
            tokio::spawn(supervise(self.registry.clone(), launch, gate, cancel_rx));
        }
        Ok(())
    }

    /// Drop the bookkeeping of a finished job, or of every finished task of
    /// an array. Returns `false` when nothing finished was known by that id.
    ///
    /// The registry keeps finished jobs until they are forgotten, so a
    /// long-lived scheduler should forget jobs whose results were collected.
    pub async fn forget(&self, job_id: &str) -> bool {
        if self.registry.status(job_id).await.is_some() {
            return self.registry.remove_finished(job_id).await;
        }
        let mut any = false;
        for task in self.registry.task_ids(job_id).await {
            any |= self.registry.remove_finished(&task).await;
        }
        any
    }

    /// Forget every finished job. Returns how many were dropped.
    pub async fn forget_finished(&self) -> usize {
        self.registry.prune_finished().await
    }

    fn base_launch(&self, job: &Job, job_id: String, script: Arc<str>) -> Launch {
        Launch {
            stdout: self.output_file(job, &job_id, OutputStream::Stdout),
            stderr: self.output_file(job, &job_id, OutputStream::Stderr),
            job_id,
            shell: self.config.shell.clone(),
            script,
            inherit_env: job.inherit_env(),
            array_task: None,
            walltime: job.time().and_then(parse_walltime_secs).map(Duration::from_secs),
        }
    }
}

/// Wait for the job's gate, run it, and record how it ended.
async fn supervise(
    registry: Arc<ProcessRegistry>,
    launch: Launch,
    gate: Gate,
    mut cancel: oneshot::Receiver<Ack>,
) {
    let job_id = launch.job_id.clone();

    let satisfied = tokio::select! {
        ok = dependency::gate_satisfied(gate.dependency_type, &gate.upstream, gate.poll) => ok,
        ack = &mut cancel => {
            acknowledge(ack);
            return;
        }
    };
    if !satisfied {
        tracing::warn!(
            "Skipping local job {job_id}: {} dependency not satisfied",
            gate.dependency_type
        );
        registry.finish(&job_id, Outcome::Skipped).await;
        return;
    }

    let _permit = match gate.slots {
        Some(slots) => tokio::select! {
            permit = slots.acquire_owned() => permit.ok(),
            ack = &mut cancel => {
                acknowledge(ack);
                return;
            }
        },
        None => None,
    };

    if !registry.mark_running(&job_id).await {
        if let Ok(ack) = cancel.try_recv() {
            let _ = ack.send(());
        }
        return;
    }

    let child = match spawn(&launch).await {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!("Failed to start local job {job_id}: {e}");
            registry.finish(&job_id, Outcome::Exited(127)).await;
            return;
        }
    };
    tracing::debug!("local job {job_id} started as pid {:?}", child.id());
    monitor(registry, launch, child, cancel).await;
}

/// Wait for a started process and record how it ended.
async fn monitor(
    registry: Arc<ProcessRegistry>,
    launch: Launch,
    mut child: tokio::process::Child,
    mut cancel: oneshot::Receiver<Ack>,
) {
    let Launch { job_id, walltime: limit, .. } = launch;
    let walltime = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        status = child.wait() => {
            let outcome = match status {
                Ok(status) => Outcome::Exited(exit_code_of(&status)),
                Err(e) => {
                    tracing::warn!("Lost track of local job {job_id}: {e}");
                    Outcome::Exited(-1)
                }
            };
            registry.finish(&job_id, outcome).await;
        }
        ack = &mut cancel => {
            let _ = child.kill().await;
            registry.finish(&job_id, Outcome::Cancelled).await;
            acknowledge(ack);
        }
        _ = walltime => {
            tracing::info!("Local job {job_id} exceeded its walltime");
            let _ = child.kill().await;
            registry.finish(&job_id, Outcome::TimedOut).await;
        }
    }
}

fn acknowledge(ack: Result<Ack, oneshot::error::RecvError>) {
    if let Ok(ack) = ack {
        let _ = ack.send(());
    }
}

/// Start the job's shell with its output files and a per-process environment.
async fn spawn(launch: &Launch) -> SchedResult<tokio::process::Child> {
    for path in [&launch.stdout, &launch.stderr] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let stdout = tokio::fs::File::create(&launch.stdout).await?.into_std().await;
    let stderr = if launch.stderr == launch.stdout {
        stdout.try_clone()?
    } else {
        tokio::fs::File::create(&launch.stderr).await?.into_std().await
    };

    let mut command = Command::new(&launch.shell);
    command
        .arg("-c")
        .arg(&*launch.script)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if !launch.inherit_env {
        command.env_clear();
        for name in BASE_ENV {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }
    }
    if let Some(index) = launch.array_task {
        command.env(ARRAY_TASK_ENV, index.to_string());
    }

    command.spawn().map_err(|e| SchedError::CommandFailed {
        command: launch.shell.clone(),
        message: e.to_string(),
    })
}

#[async_trait]
impl Scheduler for LocalScheduler {
    fn name(&self) -> &str {
        "local"
    }

    fn generate_script(&self, job: &Job, _array: Option<&JobArray>) -> SchedResult<String> {
        let context = ScriptContext {
            job,
            scheduler: self.name(),
            directives: Vec::new(),
        };
        self.renderer.render("local", &context)
    }

    /// The shell invocation; the rendered script is its last argument.
    fn build_submit_command(&self, _job: &Job) -> SchedResult<Vec<String>> {
        Ok(args([self.config.shell.as_str(), "-c"]))
    }

    async fn submit_job(&self, job: &Job) -> SchedResult<String> {
        let script: Arc<str> = self.generate_script(job, None)?.into();
        let job_id = Self::next_id();
        let launch = self.base_launch(job, job_id.clone(), script);
        self.launch(job, launch, self.gate(job, None)).await?;
        tracing::debug!("local job {job_id} submitted");
        Ok(job_id)
    }

    async fn submit_array_job(&self, array: &JobArray) -> SchedResult<String> {
        let job = array.job();
        let script: Arc<str> = self.generate_script(job, Some(array))?.into();
        let base_id = Self::next_id();
        let slots = array
            .max_concurrent()
            .map(|max| Arc::new(Semaphore::new(max as usize)));
        for index in array.indices() {
            let mut launch = self.base_launch(job, task_id(&base_id, index), script.clone());
            launch.array_task = Some(index);
            self.launch(job, launch, self.gate(job, slots.clone())).await?;
        }
        Ok(base_id)
    }

    async fn run_interactive(&self, job: &Job) -> SchedResult<i32> {
        let script = self.generate_script(job, None)?;
        let mut command = self.build_submit_command(job)?;
        command.push(script);
        let (program, rest) = command.split_at(1);
        self.runner.foreground(&program[0], rest).await
    }

    async fn cancel(&self, job_id: &str) -> bool {
        if self.registry.status(job_id).await.is_some() {
            let cancelled = self.registry.cancel(job_id, CANCEL_GRACE).await;
            if cancelled {
                tracing::info!("Cancelled local job {job_id}");
            }
            return cancelled;
        }
        // An array base id cancels every task that is still active.
        let mut any = false;
        for task in self.registry.task_ids(job_id).await {
            any |= self.registry.cancel(&task, CANCEL_GRACE).await;
        }
        if any {
            tracing::info!("Cancelled local array {job_id}");
        }
        any
    }

    async fn get_status(&self, job_id: &str) -> JobStatus {
        match self.registry.status(job_id).await {
            Some(status) => status,
            None => aggregate(&self.registry.task_statuses(job_id).await),
        }
    }

    async fn get_exit_code(&self, job_id: &str) -> Option<i32> {
        self.registry.exit_code(job_id).await
    }

    async fn get_output_path(&self, job_id: &str, stream: OutputStream) -> Option<PathBuf> {
        self.registry.output_path(job_id, stream).await
    }

    async fn list_active_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
        let jobs = self.registry.snapshot().await;
        Ok(filter.apply(jobs.into_iter().filter(JobInfo::is_active)))
    }

    async fn list_completed_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
        let jobs = self.registry.snapshot().await;
        Ok(filter.apply(jobs.into_iter().filter(JobInfo::is_complete)))
    }

    async fn has_accounting(&self) -> bool {
        true
    }

    async fn get_job_details(&self, job_id: &str) -> SchedResult<JobInfo> {
        if let Some(info) = self.registry.info(job_id).await {
            return Ok(info);
        }
        match aggregate(&self.registry.task_statuses(job_id).await) {
            JobStatus::Unknown => Err(SchedError::JobNotFound(job_id.to_string())),
            status => Ok(JobInfo::new(job_id, status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::scheduler::SchedulerExt;

    fn scheduler() -> (TempDir, Arc<dyn Scheduler>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::default();
        config.local.output_dir = dir.path().to_path_buf();
        config.local.dependency_poll_ms = 20;
        (dir, Arc::new(LocalScheduler::new(&config)))
    }

    fn fast() -> WaitOptions {
        WaitOptions::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_timeout(Duration::from_secs(20))
    }

    #[tokio::test]
    async fn test_run_and_capture_output() {
        let (_dir, local) = scheduler();
        let job = Job::new("echo hello; echo oops >&2").unwrap().with_name("greet").unwrap();
        let result = local.submit(&job, false).await.unwrap();

        assert_eq!(result.wait(fast()).await.unwrap(), JobStatus::Completed);
        assert_eq!(result.exit_code().await, Some(0));
        assert_eq!(result.read_output(OutputStream::Stdout).await.unwrap(), "hello\n");
        assert_eq!(result.read_output(OutputStream::Stderr).await.unwrap(), "oops\n");

        let path = result.output_path(OutputStream::Stdout).await.unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("greet.{}.out", result.job_id())
        );
    }

    #[tokio::test]
    async fn test_ungated_job_running_on_return() {
        let (_dir, local) = scheduler();
        let result = local.submit(&Job::new("sleep 30").unwrap(), false).await.unwrap();
        let info = local.get_job_details(result.job_id()).await.unwrap();
        assert_eq!(info.status, JobStatus::Running);
        assert!(info.start_time.is_some());
        result.cancel().await;
    }

    #[tokio::test]
    async fn test_unstartable_shell_is_submission_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::default();
        config.local.output_dir = dir.path().to_path_buf();
        config.local.shell = "/nonexistent/hpcrun-shell".to_string();
        let local = LocalScheduler::new(&config);
        assert!(matches!(
            local.submit_job(&Job::new("true").unwrap()).await,
            Err(SchedError::Submission { .. })
        ));
    }

    #[tokio::test]
    async fn test_forget_finished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::default();
        config.local.output_dir = dir.path().to_path_buf();
        let local = Arc::new(LocalScheduler::new(&config));
        let shared: Arc<dyn Scheduler> = local.clone();

        let done = shared.submit(&Job::new("true").unwrap(), false).await.unwrap();
        done.wait(fast()).await.unwrap();
        let running = shared.submit(&Job::new("sleep 30").unwrap(), false).await.unwrap();

        assert!(!local.forget(running.job_id()).await);
        assert!(local.forget(done.job_id()).await);
        assert_eq!(local.get_status(done.job_id()).await, JobStatus::Unknown);

        running.cancel().await;
        assert_eq!(local.forget_finished().await, 1);
        assert!(local.list_active_jobs(&JobFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_exit_code() {
        let (_dir, local) = scheduler();
        let result = local.submit(&Job::new("exit 3").unwrap(), false).await.unwrap();
        assert_eq!(result.wait(fast()).await.unwrap(), JobStatus::Failed);
        assert_eq!(result.exit_code().await, Some(3));
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let (_dir, local) = scheduler();
        let result = local.submit(&Job::new("sleep 30").unwrap(), false).await.unwrap();

        assert!(!local.cancel("local-does-not-exist").await);
        assert!(result.cancel().await);
        let status = result.status().await;
        assert!(status.is_terminal());
        assert_eq!(status, JobStatus::Cancelled);
        assert_eq!(result.exit_code().await, None);
        assert!(!result.cancel().await);
    }

    #[tokio::test]
    async fn test_walltime_enforced() {
        let (_dir, local) = scheduler();
        let mut job = Job::new("sleep 30").unwrap();
        job.set_time("0:01").unwrap();
        let result = local.submit(&job, false).await.unwrap();
        assert_eq!(result.wait(fast()).await.unwrap(), JobStatus::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let (_dir, local) = scheduler();
        assert_eq!(local.get_status("local-999999").await, JobStatus::Unknown);
        assert_eq!(local.get_exit_code("local-999999").await, None);
        assert!(matches!(
            local.get_job_details("local-999999").await,
            Err(SchedError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_array_tasks_get_their_index() {
        let (_dir, local) = scheduler();
        let job = Job::new(format!("echo task ${ARRAY_TASK_ENV}")).unwrap();
        let array = JobArray::from_range(job, "1-7:3%2").unwrap();
        let result = local.submit_array(&array).await.unwrap();

        assert_eq!(result.task_ids().len(), 3);
        for (_, status) in result.wait(fast()).await.unwrap() {
            assert_eq!(status, JobStatus::Completed);
        }
        let task = result.task(4).unwrap();
        assert_eq!(task.read_output(OutputStream::Stdout).await.unwrap(), "task 4\n");
        assert_eq!(local.get_status(result.base_id()).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_dependency_gate() {
        let (_dir, local) = scheduler();
        let failing = local.submit(&Job::new("exit 1").unwrap(), false).await.unwrap();
        let gated = Job::new("echo never").unwrap().with_dependency(failing.clone());
        let skipped = local.submit(&gated, false).await.unwrap();
        assert_eq!(skipped.wait(fast()).await.unwrap(), JobStatus::Cancelled);

        let cleanup = Job::new("echo cleanup")
            .unwrap()
            .with_dependency(failing)
            .with_dependency_type(DependencyType::AfterNotOk);
        let ran = local.submit(&cleanup, false).await.unwrap();
        assert_eq!(ran.wait(fast()).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_scoped_environment() {
        let (_dir, local) = scheduler();
        let check = "test -n \"$PATH\" && \
            test -z \"$(env | grep -vE '^(PATH|HOME|USER|PWD|OLDPWD|SHLVL|_)=')\"";
        let job = Job::new(check).unwrap().with_inherit_env(false);
        let result = local.submit(&job, false).await.unwrap();
        assert_eq!(result.wait(fast()).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_interactive_runs_in_foreground() {
        let runner = Arc::new(ScriptedRunner::new().ok("bash", ""));
        let local = LocalScheduler::with_runner(&SchedulerConfig::default(), runner.clone());
        let code = local.run_interactive(&Job::new("hostname").unwrap()).await.unwrap();
        assert_eq!(code, 0);
        let call = &runner.calls()[0];
        assert_eq!(call[..2], ["bash", "-c"]);
        assert!(call[2].ends_with("hostname\n"));
    }

    #[tokio::test]
    async fn test_listings() {
        let (_dir, local) = scheduler();
        let done = local.submit(&Job::new("true").unwrap(), false).await.unwrap();
        done.wait(fast()).await.unwrap();
        let running = local.submit(&Job::new("sleep 30").unwrap(), false).await.unwrap();

        let active = local.list_active_jobs(&JobFilter::default()).await.unwrap();
        assert!(active.iter().any(|j| j.job_id == running.job_id()));
        let completed = local.list_completed_jobs(&JobFilter::default()).await.unwrap();
        assert!(completed.iter().any(|j| j.job_id == done.job_id()));
        assert!(local.has_accounting().await);
        running.cancel().await;
    }
}
