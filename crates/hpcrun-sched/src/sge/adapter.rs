//! Grid Engine adapter for job submission and tracking.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::array::{JobArray, split_task_id};
use crate::command::{CommandRunner, SystemRunner, args, query, submit_script};
use crate::dependency;
use crate::descriptor::{ArgTable, Attr, SchedulerArg, walltime_to_hms};
use crate::error::{SchedError, SchedResult};
use crate::info::{JobFilter, JobInfo};
use crate::job::Job;
use crate::render::{BuiltinRenderer, DirectiveBlock, ScriptContext, ScriptRenderer};
use crate::scheduler::{BackendKind, Scheduler, SchedulerConfig, basic_job_details};
use crate::sge::parser::{self, QstatRow};
use crate::status::{JobStatus, OutputStream};

const PREFIX: &str = "#$";

/// Configuration for the Grid Engine adapter.
///
/// Resource names differ between sites, so the ones used for CPUs, memory
/// and walltime are configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SgeConfig {
    /// Parallel environment requested for multi-CPU jobs.
    pub parallel_env: String,

    /// Complex used for memory requests.
    pub mem_resource: String,

    /// Complex used for walltime requests.
    pub time_resource: String,
}

impl Default for SgeConfig {
    fn default() -> Self {
        Self {
            parallel_env: "smp".to_string(),
            mem_resource: "mem_free".to_string(),
            time_resource: "h_rt".to_string(),
        }
    }
}

/// Attribute table for `qsub`. Grid Engine has no node or task counts.
pub fn sge_args(config: &SgeConfig) -> ArgTable {
    let pe = config.parallel_env.clone();
    let mem = config.mem_resource.clone();
    let time = config.time_resource.clone();
    ArgTable::new(
        "sge",
        vec![
            SchedulerArg::short(Attr::Cpu, PREFIX, "-pe", "Parallel environment slots")
                .with_converter(move |v| format!("{pe} {v}")),
            SchedulerArg::short(Attr::Mem, PREFIX, "-l", "Memory request")
                .with_converter(move |v| format!("{mem}={v}")),
            SchedulerArg::short(Attr::Time, PREFIX, "-l", "Hard runtime limit")
                .with_converter(move |v| format!("{time}={}", walltime_to_hms(v))),
            SchedulerArg::short(Attr::Queue, PREFIX, "-q", "Queue").with_env_var("HPCRUN_QUEUE"),
            SchedulerArg::short(Attr::Name, PREFIX, "-N", "Job name").with_validator(job_name_ok),
            SchedulerArg::short(Attr::Stdout, PREFIX, "-o", "Stdout file")
                .with_default("$JOB_NAME.o$JOB_ID"),
            SchedulerArg::short(Attr::Stderr, PREFIX, "-e", "Stderr file"),
        ],
    )
}

/// `qsub -N` refuses names containing any of `/ : @ \ * ?`.
fn job_name_ok(name: &str) -> bool {
    !name.contains(['/', ':', '@', '\\', '*', '?'])
}

/// Adapter for Sun/Son of/Univa Grid Engine.
pub struct SgeScheduler {
    script_dir: PathBuf,
    args: ArgTable,
    runner: Arc<dyn CommandRunner>,
    renderer: Arc<dyn ScriptRenderer>,
}

impl SgeScheduler {
    /// Create an adapter that runs the real Grid Engine CLIs.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner::new(config.command_timeout())))
    }

    /// Create an adapter that issues its commands through `runner`.
    pub fn with_runner(config: &SchedulerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            script_dir: config.script_dir.clone(),
            args: sge_args(&config.sge),
            runner,
            renderer: Arc::new(BuiltinRenderer),
        }
    }

    /// Replace the script renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn ScriptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn args(&self) -> &ArgTable {
        &self.args
    }

    fn directives(&self, job: &Job, array: Option<&JobArray>) -> SchedResult<Vec<String>> {
        let mut block = DirectiveBlock::new(PREFIX);
        block.extend(self.args.directives(job)?);
        if let Some(array) = array {
            block.push(format!("-t {}", array.bounds_str()));
            if let Some(max) = array.max_concurrent() {
                block.push(format!("-tc {max}"));
            }
        }
        for resource in job.resources().iter() {
            block.push(format!("-l {}={}", resource.name, resource.value));
        }
        if let Some(dependency) = dependency::render(BackendKind::Sge, job)? {
            block.push(dependency);
        }
        block.push("-S /bin/bash");
        match job.workdir() {
            Some(dir) => block.push(format!("-wd {}", dir.display())),
            None => block.push("-cwd"),
        }
        if job.inherit_env() {
            block.push("-V");
        }
        if job.stderr().is_none() {
            block.push("-j y");
        }
        block.raw(job.raw_args());
        block.raw(self.scheduler_args(job));
        Ok(block.into_lines())
    }

    /// `qrsh` command line for a foreground run.
    fn interactive_command(&self, job: &Job) -> SchedResult<Vec<String>> {
        let mut command = vec!["qrsh".to_string(), "-now".to_string(), "no".to_string()];
        match job.workdir() {
            Some(dir) => command.extend(args(["-wd".to_string(), dir.display().to_string()])),
            None => command.push("-cwd".to_string()),
        }
        if job.inherit_env() {
            command.push("-V".to_string());
        }
        command.extend(self.args.args(job)?);
        for resource in job.resources().iter() {
            command.push("-l".to_string());
            command.push(format!("{}={}", resource.name, resource.value));
        }
        command.extend(job.raw_args().iter().cloned());
        command.extend(self.scheduler_args(job).iter().cloned());
        command.extend(args(["bash", "-c", job.command()]));
        Ok(command)
    }

    /// Rows of the live queue for `job_id`, which may name one array task.
    async fn queued_rows(&self, job_id: &str) -> Vec<QstatRow> {
        let (base, task) = split(job_id);
        let Some(output) = query(&*self.runner, "qstat", &args(["-u", "*"])).await else {
            return Vec::new();
        };
        parser::parse_qstat_plain(&output)
            .into_iter()
            .filter(|row| row.job_id == base)
            .filter(|row| task.is_none_or(|t| row.covers_task(t)))
            .collect()
    }

    async fn qacct(&self, job_id: &str) -> Option<rustc_hash::FxHashMap<String, String>> {
        let (base, task) = split(job_id);
        let mut command = args(["-j", base]);
        if let Some(task) = task {
            command.extend(args(["-t".to_string(), task.to_string()]));
        }
        let output = query(&*self.runner, "qacct", &command).await?;
        let record = parser::parse_qacct_output(&output);
        (!record.is_empty()).then_some(record)
    }
}

/// Split a task id into the Grid Engine job number and task index.
fn split(job_id: &str) -> (&str, Option<u32>) {
    match split_task_id(job_id) {
        Some((base, index)) => (base, Some(index)),
        None => (job_id, None),
    }
}

/// For arrays, give each task its own default output file.
fn array_job(array: &JobArray) -> SchedResult<Job> {
    let mut job = array.job().clone();
    if job.stdout().is_none() {
        job.set_stdout("$JOB_NAME.o$JOB_ID.$TASK_ID")?;
    }
    Ok(job)
}

/// One status for all rows of a job: running tasks win over queued ones.
fn row_status(rows: &[QstatRow]) -> Option<JobStatus> {
    let statuses: Vec<JobStatus> = rows.iter().map(|r| parser::parse_state(&r.state)).collect();
    if statuses.contains(&JobStatus::Running) {
        return Some(JobStatus::Running);
    }
    statuses.into_iter().find(|s| *s != JobStatus::Unknown)
}

#[async_trait]
impl Scheduler for SgeScheduler {
    fn name(&self) -> &str {
        "sge"
    }

    fn generate_script(&self, job: &Job, array: Option<&JobArray>) -> SchedResult<String> {
        let context = ScriptContext {
            job,
            scheduler: self.name(),
            directives: self.directives(job, array)?,
        };
        self.renderer.render("sge", &context)
    }

    fn build_submit_command(&self, job: &Job) -> SchedResult<Vec<String>> {
        let mut command = args(["qsub", "-terse"]);
        command.extend(self.args.args(job)?);
        Ok(command)
    }

    async fn submit_job(&self, job: &Job) -> SchedResult<String> {
        let script = self.generate_script(job, None)?;
        let command = self.build_submit_command(job)?;
        let stdout =
            submit_script(&*self.runner, self.name(), &self.script_dir, &script, command).await?;
        parser::parse_qsub_output(&stdout)
    }

    async fn submit_array_job(&self, array: &JobArray) -> SchedResult<String> {
        let job = array_job(array)?;
        let script = self.generate_script(&job, Some(array))?;
        let command = self.build_submit_command(&job)?;
        let stdout =
            submit_script(&*self.runner, self.name(), &self.script_dir, &script, command).await?;
        parser::parse_qsub_output(&stdout)
    }

    async fn run_interactive(&self, job: &Job) -> SchedResult<i32> {
        let command = self.interactive_command(job)?;
        let (program, rest) = command.split_at(1);
        self.runner.foreground(&program[0], rest).await
    }

    async fn cancel(&self, job_id: &str) -> bool {
        let (base, task) = split(job_id);
        let mut command = args([base]);
        if let Some(task) = task {
            command.extend(args(["-t".to_string(), task.to_string()]));
        }
        match self.runner.output("qdel", &command).await {
            Ok(output) if output.success() => {
                tracing::info!("Cancelled SGE job {job_id}");
                true
            }
            Ok(output) => {
                tracing::debug!("qdel {job_id}: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                tracing::debug!("qdel {job_id} failed: {e}");
                false
            }
        }
    }

    async fn get_status(&self, job_id: &str) -> JobStatus {
        if let Some(status) = row_status(&self.queued_rows(job_id).await) {
            return status;
        }
        // qacct only knows jobs that have left the queue
        self.qacct(job_id)
            .await
            .and_then(|record| parser::qacct_status(&record))
            .unwrap_or(JobStatus::Unknown)
    }

    async fn get_exit_code(&self, job_id: &str) -> Option<i32> {
        if !self.get_status(job_id).await.is_terminal() {
            return None;
        }
        let record = self.qacct(job_id).await?;
        parser::qacct_exit_code(&record)
    }

    async fn get_output_path(&self, job_id: &str, stream: OutputStream) -> Option<PathBuf> {
        let (base, task) = split(job_id);
        let output = query(&*self.runner, "qstat", &args(["-j", base])).await?;
        let fields = parser::parse_qstat_job(&output);
        let key = match stream {
            OutputStream::Stdout => "stdout_path_list",
            OutputStream::Stderr => "stderr_path_list",
        };
        parser::output_path(&fields, key, base, task)
    }

    async fn list_active_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
        let mut command = args(["-u", filter.user.as_deref().unwrap_or("*")]);
        if let Some(queue) = &filter.queue {
            command.extend(args(["-q", queue.as_str()]));
        }
        let output = self.runner.output("qstat", &command).await?;
        if !output.success() {
            return Err(SchedError::CommandFailed {
                command: "qstat".to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        let jobs = parser::parse_qstat_plain(&output.stdout)
            .iter()
            .map(parser::job_info_from_row)
            .collect::<Vec<_>>();
        Ok(filter.apply(jobs))
    }

    async fn get_job_details(&self, job_id: &str) -> SchedResult<JobInfo> {
        match self.queued_rows(job_id).await.first() {
            Some(row) => {
                let mut info = parser::job_info_from_row(row);
                info.job_id = job_id.to_string();
                info.stdout_path = self.get_output_path(job_id, OutputStream::Stdout).await;
                info.stderr_path = self.get_output_path(job_id, OutputStream::Stderr).await;
                Ok(info)
            }
            None => basic_job_details(self, job_id).await,
        }
    }
}
