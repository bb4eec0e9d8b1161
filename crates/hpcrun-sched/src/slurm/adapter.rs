//! SLURM adapter for job submission and tracking.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::array::JobArray;
use crate::command::{CommandRunner, SystemRunner, args, query, submit_script};
use crate::dependency;
use crate::descriptor::{ArgTable, Attr, SchedulerArg};
use crate::error::{SchedError, SchedResult};
use crate::info::{JobFilter, JobInfo};
use crate::job::Job;
use crate::render::{BuiltinRenderer, DirectiveBlock, ScriptContext, ScriptRenderer};
use crate::scheduler::{BackendKind, Scheduler, SchedulerConfig, basic_job_details};
use crate::slurm::parser;
use crate::status::{JobStatus, OutputStream};

const PREFIX: &str = "#SBATCH";

/// Configuration for the SLURM adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    /// Account charged for submitted jobs.
    pub account: Option<String>,

    /// Whether `sacct` is available for finished jobs.
    pub accounting: bool,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            account: None,
            accounting: true,
        }
    }
}

/// Attribute table for `sbatch`.
pub fn slurm_args() -> ArgTable {
    ArgTable::new(
        "slurm",
        vec![
            SchedulerArg::long(Attr::Cpu, PREFIX, "--cpus-per-task", "CPUs per task"),
            SchedulerArg::long(Attr::Mem, PREFIX, "--mem", "Memory per node"),
            SchedulerArg::long(Attr::Time, PREFIX, "--time", "Wall-clock limit"),
            SchedulerArg::long(Attr::Queue, PREFIX, "--partition", "Partition")
                .with_env_var("HPCRUN_QUEUE"),
            SchedulerArg::long(Attr::Nodes, PREFIX, "--nodes", "Number of nodes"),
            SchedulerArg::long(Attr::Tasks, PREFIX, "--ntasks", "Number of tasks"),
            SchedulerArg::long(Attr::Name, PREFIX, "--job-name", "Job name"),
            SchedulerArg::long(Attr::Stdout, PREFIX, "--output", "Stdout file")
                .with_default("%x.%j.out"),
            SchedulerArg::long(Attr::Stderr, PREFIX, "--error", "Stderr file"),
        ],
    )
}

/// Adapter for the SLURM workload manager.
pub struct SlurmScheduler {
    config: SlurmConfig,
    script_dir: PathBuf,
    args: ArgTable,
    runner: Arc<dyn CommandRunner>,
    renderer: Arc<dyn ScriptRenderer>,
}

impl SlurmScheduler {
    /// Create an adapter that runs the real SLURM CLIs.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner::new(config.command_timeout())))
    }

    /// Create an adapter that issues its commands through `runner`.
    pub fn with_runner(config: &SchedulerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config: config.slurm.clone(),
            script_dir: config.script_dir.clone(),
            args: slurm_args(),
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
            block.push(format!("--array={}", array.range_str()));
        }
        for resource in job.resources().iter() {
            block.push(format!("--gres={}:{}", resource.name, resource.value));
        }
        if let Some(dependency) = dependency::render(BackendKind::Slurm, job)? {
            block.push(dependency);
        }
        block.push(if job.inherit_env() {
            "--export=ALL"
        } else {
            "--export=NONE"
        });
        if let Some(account) = &self.config.account {
            block.push(format!("--account={account}"));
        }
        block.raw(job.raw_args());
        block.raw(self.scheduler_args(job));
        Ok(block.into_lines())
    }

    /// `srun` command line for a foreground run.
    fn interactive_command(&self, job: &Job) -> SchedResult<Vec<String>> {
        let mut command = vec!["srun".to_string()];
        command.extend(self.args.args(job)?);
        if let Some(dir) = job.workdir() {
            command.push(format!("--chdir={}", dir.display()));
        }
        for resource in job.resources().iter() {
            command.push(format!("--gres={}:{}", resource.name, resource.value));
        }
        command.extend(job.raw_args().iter().cloned());
        command.extend(self.scheduler_args(job).iter().cloned());
        command.extend(args(["bash", "-c", job.command()]));
        Ok(command)
    }

    async fn scontrol(&self, job_id: &str) -> Option<rustc_hash::FxHashMap<String, String>> {
        let output = query(&*self.runner, "scontrol", &args(["show", "job", job_id])).await?;
        Some(parser::parse_scontrol(&output))
    }

    async fn listing(&self, program: &str, command: Vec<String>) -> SchedResult<String> {
        let output = self.runner.output(program, &command).await?;
        if !output.success() {
            return Err(SchedError::CommandFailed {
                command: program.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// For arrays, give each task its own default output file.
fn array_job(array: &JobArray) -> SchedResult<Job> {
    let mut job = array.job().clone();
    if job.stdout().is_none() {
        job.set_stdout("%x.%A_%a.out")?;
    }
    Ok(job)
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    fn name(&self) -> &str {
        "slurm"
    }

    fn generate_script(&self, job: &Job, array: Option<&JobArray>) -> SchedResult<String> {
        let context = ScriptContext {
            job,
            scheduler: self.name(),
            directives: self.directives(job, array)?,
        };
        self.renderer.render("slurm", &context)
    }

    fn build_submit_command(&self, job: &Job) -> SchedResult<Vec<String>> {
        let mut command = args(["sbatch", "--parsable"]);
        command.extend(self.args.args(job)?);
        Ok(command)
    }

    async fn submit_job(&self, job: &Job) -> SchedResult<String> {
        let script = self.generate_script(job, None)?;
        let command = self.build_submit_command(job)?;
        let stdout =
            submit_script(&*self.runner, self.name(), &self.script_dir, &script, command).await?;
        parser::parse_sbatch_output(&stdout)
    }

    async fn submit_array_job(&self, array: &JobArray) -> SchedResult<String> {
        let job = array_job(array)?;
        let script = self.generate_script(&job, Some(array))?;
        let command = self.build_submit_command(&job)?;
        let stdout =
            submit_script(&*self.runner, self.name(), &self.script_dir, &script, command).await?;
        parser::parse_sbatch_output(&stdout)
    }

    async fn run_interactive(&self, job: &Job) -> SchedResult<i32> {
        let command = self.interactive_command(job)?;
        let (program, rest) = command.split_at(1);
        self.runner.foreground(&program[0], rest).await
    }

    async fn cancel(&self, job_id: &str) -> bool {
        match self.runner.output("scancel", &args([job_id])).await {
            Ok(output) if output.success() => {
                tracing::info!("Cancelled SLURM job {job_id}");
                true
            }
            Ok(output) => {
                tracing::debug!("scancel {job_id}: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                tracing::debug!("scancel {job_id} failed: {e}");
                false
            }
        }
    }

    async fn get_status(&self, job_id: &str) -> JobStatus {
        // squeue knows pending and running jobs
        let live = args(["-h", "-j", job_id, "-o", "%T"]);
        if let Some(status) = query(&*self.runner, "squeue", &live)
            .await
            .and_then(|out| parser::parse_squeue_state(&out))
            .filter(|s| *s != JobStatus::Unknown)
        {
            return status;
        }

        if !self.config.accounting {
            return JobStatus::Unknown;
        }

        // sacct covers finished jobs
        let historical = args(["-j", job_id, "-n", "-X", "-o", "State"]);
        query(&*self.runner, "sacct", &historical)
            .await
            .and_then(|out| parser::parse_sacct_state(&out))
            .unwrap_or(JobStatus::Unknown)
    }

    async fn get_exit_code(&self, job_id: &str) -> Option<i32> {
        if !self.get_status(job_id).await.is_terminal() {
            return None;
        }
        let command = args(["-j", job_id, "-n", "-X", "-o", "ExitCode"]);
        let output = query(&*self.runner, "sacct", &command).await?;
        parser::parse_exit_code(&output)
    }

    async fn get_output_path(&self, job_id: &str, stream: OutputStream) -> Option<PathBuf> {
        let fields = self.scontrol(job_id).await?;
        let key = match stream {
            OutputStream::Stdout => "StdOut",
            OutputStream::Stderr => "StdErr",
        };
        parser::output_path(&fields, key)
    }

    async fn list_active_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
        let mut command = args(["-h", "-o", parser::SQUEUE_FORMAT]);
        if let Some(user) = &filter.user {
            command.extend(args(["-u", user.as_str()]));
        }
        if let Some(queue) = &filter.queue {
            command.extend(args(["-p", queue.as_str()]));
        }
        let output = self.listing("squeue", command).await?;
        Ok(filter.apply(parser::parse_squeue_listing(&output)))
    }

    async fn list_completed_jobs(&self, filter: &JobFilter) -> SchedResult<Vec<JobInfo>> {
        if !self.config.accounting {
            return Err(SchedError::unsupported(self.name(), "job accounting"));
        }
        let mut command = args(["-n", "-X", "-P", "-o", parser::SACCT_FIELDS]);
        match &filter.user {
            Some(user) => command.extend(args(["-u", user.as_str()])),
            None => command.push("-a".to_string()),
        }
        if let Some(since) = filter.since {
            command.extend(args(["-S".to_string(), since.format("%Y-%m-%dT%H:%M:%S").to_string()]));
        }
        if let Some(until) = filter.until {
            command.extend(args(["-E".to_string(), until.format("%Y-%m-%dT%H:%M:%S").to_string()]));
        }
        if let Some(queue) = &filter.queue {
            command.extend(args(["-r", queue.as_str()]));
        }
        let output = self.listing("sacct", command).await?;
        let finished = parser::parse_sacct_listing(&output)
            .into_iter()
            .filter(JobInfo::is_complete);
        Ok(filter.apply(finished))
    }

    async fn has_accounting(&self) -> bool {
        self.config.accounting
            && query(&*self.runner, "sacct", &args(["--version"]))
                .await
                .is_some()
    }

    async fn get_job_details(&self, job_id: &str) -> SchedResult<JobInfo> {
        match self.scontrol(job_id).await {
            Some(fields) if fields.contains_key("JobState") => {
                Ok(parser::job_info_from_scontrol(job_id, &fields))
            }
            _ => basic_job_details(self, job_id).await,
        }
    }
}
