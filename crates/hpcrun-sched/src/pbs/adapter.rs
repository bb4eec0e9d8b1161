//! PBS adapter for job submission and tracking.

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
use crate::pbs::parser::{self, PbsJobInfo};
use crate::render::{BuiltinRenderer, DirectiveBlock, ScriptContext, ScriptRenderer};
use crate::scheduler::{BackendKind, Scheduler, SchedulerConfig, basic_job_details};
use crate::status::{JobStatus, OutputStream};

const PREFIX: &str = "#PBS";

/// Configuration for the PBS adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PbsConfig {
    /// PBS server queried for listings (`@server`); the default server otherwise.
    pub server: Option<String>,

    /// Account string for job accounting.
    pub account: Option<String>,

    /// Whether `qstat -x` job history is enabled on the server.
    pub history: bool,
}

impl Default for PbsConfig {
    fn default() -> Self {
        Self {
            server: None,
            account: None,
            history: true,
        }
    }
}

/// `16G` -> `16gb`, `512` -> `512mb`.
fn pbs_memory(value: &str) -> String {
    let value = value.trim().to_lowercase();
    match value.chars().last() {
        Some(c) if c.is_ascii_digit() => format!("{value}mb"),
        Some('k' | 'm' | 'g' | 't' | 'p') => format!("{value}b"),
        _ => value,
    }
}

/// Attribute table for PBS `qsub`.
pub fn pbs_args() -> ArgTable {
    ArgTable::new(
        "pbs",
        vec![
            SchedulerArg::short(Attr::Cpu, PREFIX, "-l", "CPUs")
                .with_converter(|v| format!("ncpus={v}")),
            SchedulerArg::short(Attr::Mem, PREFIX, "-l", "Memory")
                .with_converter(|v| format!("mem={}", pbs_memory(v))),
            SchedulerArg::short(Attr::Time, PREFIX, "-l", "Wall-clock limit")
                .with_converter(|v| format!("walltime={}", walltime_to_hms(v))),
            SchedulerArg::short(Attr::Queue, PREFIX, "-q", "Destination queue")
                .with_env_var("HPCRUN_QUEUE"),
            SchedulerArg::short(Attr::Nodes, PREFIX, "-l", "Number of nodes")
                .with_converter(|v| format!("nodes={v}")),
            SchedulerArg::short(Attr::Tasks, PREFIX, "-l", "MPI processes")
                .with_converter(|v| format!("mpiprocs={v}")),
            SchedulerArg::short(Attr::Name, PREFIX, "-N", "Job name"),
            SchedulerArg::short(Attr::Stdout, PREFIX, "-o", "Stdout file"),
            SchedulerArg::short(Attr::Stderr, PREFIX, "-e", "Stderr file"),
        ],
    )
}

/// Adapter for PBS Pro, OpenPBS and Torque.
pub struct PbsScheduler {
    config: PbsConfig,
    script_dir: PathBuf,
    args: ArgTable,
    runner: Arc<dyn CommandRunner>,
    renderer: Arc<dyn ScriptRenderer>,
}

impl PbsScheduler {
    /// Create an adapter that runs the real PBS CLIs.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner::new(config.command_timeout())))
    }

    /// Create an adapter that issues its commands through `runner`.
    pub fn with_runner(config: &SchedulerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config: config.pbs.clone(),
            script_dir: config.script_dir.clone(),
            args: pbs_args(),
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
            block.push(format!("-J {}", array.bounds_str()));
            if let Some(max) = array.max_concurrent() {
                block.push(format!("-W max_run_subjobs={max}"));
            }
        }
        for resource in job.resources().iter() {
            block.push(format!("-l {}={}", resource.name, resource.value));
        }
        if let Some(dependency) = dependency::render(BackendKind::Pbs, job)? {
            block.push(dependency);
        }
        if job.inherit_env() {
            block.push("-V");
        }
        if let Some(account) = &self.config.account {
            block.push(format!("-A {account}"));
        }
        if job.stderr().is_none() {
            block.push("-j oe");
        }
        block.raw(job.raw_args());
        block.raw(self.scheduler_args(job));
        Ok(block.into_lines())
    }

    /// `qsub -I` command line for a foreground run.
    fn interactive_command(&self, job: &Job) -> SchedResult<Vec<String>> {
        let mut command = args(["qsub", "-I"]);
        if job.inherit_env() {
            command.push("-V".to_string());
        }
        if let Some(account) = &self.config.account {
            command.extend(args(["-A", account.as_str()]));
        }
        command.extend(self.args.args(job)?);
        for resource in job.resources().iter() {
            command.push("-l".to_string());
            command.push(format!("{}={}", resource.name, resource.value));
        }
        command.extend(job.raw_args().iter().cloned());
        command.extend(self.scheduler_args(job).iter().cloned());
        command.extend(args(["--", "bash", "-c", job.command()]));
        Ok(command)
    }

    /// The job's `qstat -f` record, falling back to the `-x` history.
    async fn record(&self, job_id: &str) -> Option<PbsJobInfo> {
        let pbs_id = subjob_id(job_id);
        let live = query(&*self.runner, "qstat", &args(["-f", pbs_id.as_str()]))
            .await
            .and_then(|out| parser::parse_qstat_full_output(&out).into_iter().next())
            .filter(|job| job.status() != JobStatus::Unknown);
        if live.is_some() || !self.config.history {
            return live;
        }
        query(&*self.runner, "qstat", &args(["-xf", pbs_id.as_str()]))
            .await
            .and_then(|out| parser::parse_qstat_full_output(&out).into_iter().next())
    }

    async fn listing(&self, flag: &str) -> SchedResult<Vec<JobInfo>> {
        let mut command = args([flag]);
        if let Some(server) = &self.config.server {
            command.push(format!("@{server}"));
        }
        let output = self.runner.output("qstat", &command).await?;
        if !output.success() {
            return Err(SchedError::CommandFailed {
                command: "qstat".to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(parser::parse_qstat_full_output(&output.stdout)
            .iter()
            .map(PbsJobInfo::to_job_info)
            .collect())
    }
}

/// Translate `1234[].server_3` into the PBS subjob id `1234[3].server`.
fn subjob_id(job_id: &str) -> String {
    match split_task_id(job_id) {
        Some((base, index)) if base.contains("[]") => base.replacen("[]", &format!("[{index}]"), 1),
        _ => job_id.to_string(),
    }
}

#[async_trait]
impl Scheduler for PbsScheduler {
    fn name(&self) -> &str {
        "pbs"
    }

    fn generate_script(&self, job: &Job, array: Option<&JobArray>) -> SchedResult<String> {
        let context = ScriptContext {
            job,
            scheduler: self.name(),
            directives: self.directives(job, array)?,
        };
        self.renderer.render("pbs", &context)
    }

    fn build_submit_command(&self, job: &Job) -> SchedResult<Vec<String>> {
        let mut command = args(["qsub"]);
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
        let job = array.job();
        let script = self.generate_script(job, Some(array))?;
        let command = self.build_submit_command(job)?;
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
        let pbs_id = subjob_id(job_id);
        let output = match self.runner.output("qdel", &args([pbs_id.as_str()])).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("qdel {pbs_id} failed: {e}");
                return false;
            }
        };
        match parser::parse_qdel_output(&output.stderr) {
            Ok(()) if output.success() => {
                tracing::info!("Cancelled PBS job {pbs_id}");
                true
            }
            Ok(()) => false,
            Err(e) => {
                tracing::debug!("qdel {pbs_id}: {e}");
                false
            }
        }
    }

    async fn get_status(&self, job_id: &str) -> JobStatus {
        self.record(job_id)
            .await
            .map(|job| job.status())
            .unwrap_or(JobStatus::Unknown)
    }

    async fn get_exit_code(&self, job_id: &str) -> Option<i32> {
        let job = self.record(job_id).await?;
        if !job.status().is_terminal() {
            return None;
        }
        job.exit_status
    }

    async fn get_output_path(&self, job_id: &str, stream: OutputStream) -> Option<PathBuf> {
        let job = self.record(job_id).await?;
        let path = match stream {
            OutputStream::Stdout => job.output_path,
            OutputStream::Stderr => job.error_path,
        };
        path.as_deref().map(parser::strip_host)
    }

    async fn list_active_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
        let jobs = self.listing("-f").await?;
        Ok(filter.apply(jobs.into_iter().filter(JobInfo::is_active)))
    }

    async fn list_completed_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
        if !self.config.history {
            return Err(SchedError::unsupported(self.name(), "job history"));
        }
        let jobs = self.listing("-xf").await?;
        Ok(filter.apply(jobs.into_iter().filter(JobInfo::is_complete)))
    }

    async fn has_accounting(&self) -> bool {
        self.config.history
            && query(&*self.runner, "qstat", &args(["--version"]))
                .await
                .is_some()
    }

    async fn get_job_details(&self, job_id: &str) -> SchedResult<JobInfo> {
        match self.record(job_id).await {
            Some(job) => {
                let mut info = job.to_job_info();
                info.job_id = job_id.to_string();
                Ok(info)
            }
            None => basic_job_details(self, job_id).await,
        }
    }
}
