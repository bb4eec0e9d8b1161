//! Run command implementation.
//!
//! Build a job from the config file and flags, then submit it, print its
//! script, or run it in the foreground.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use console::style;

use hpcrun_sched::{Job, JobArray, OutputStream, SchedulerExt, WaitOptions};

use super::common::{Context, styled_status};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job name
    #[arg(short = 'N', long)]
    name: Option<String>,

    /// Job type to look up in the config file (defaults to the program name)
    #[arg(short = 't', long = "type")]
    job_type: Option<String>,

    /// CPUs per task
    #[arg(long)]
    cpu: Option<u32>,

    /// Memory, e.g. 16G
    #[arg(long)]
    mem: Option<String>,

    /// Wall-clock limit, e.g. 2:00:00
    #[arg(long)]
    time: Option<String>,

    /// Queue or partition
    #[arg(short, long)]
    queue: Option<String>,

    /// Number of nodes
    #[arg(long)]
    nodes: Option<u32>,

    /// Number of tasks
    #[arg(long)]
    tasks: Option<u32>,

    /// Stdout file
    #[arg(short, long)]
    output: Option<String>,

    /// Stderr file
    #[arg(short, long)]
    error: Option<String>,

    /// Working directory
    #[arg(short = 'C', long)]
    workdir: Option<PathBuf>,

    /// Environment module to load (repeatable)
    #[arg(short, long = "module")]
    modules: Vec<String>,

    /// Generic resource as name=value (repeatable)
    #[arg(short, long = "resource")]
    resources: Vec<String>,

    /// Raw scheduler directive passed through verbatim (repeatable)
    #[arg(long = "raw")]
    raw_args: Vec<String>,

    /// Do not export the submission environment
    #[arg(long)]
    no_env: bool,

    /// Submit as an array: start-end[:step][%max]
    #[arg(short, long)]
    array: Option<String>,

    /// Run in the foreground
    #[arg(short, long, conflicts_with = "array")]
    interactive: bool,

    /// Print the job script instead of submitting
    #[arg(long)]
    dry_run: bool,

    /// Wait for the job to finish
    #[arg(short, long)]
    wait: bool,

    /// Timeout for --wait in seconds
    #[arg(long, default_value = "86400", requires = "wait")]
    timeout: u64,

    /// Command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    /// The job described by the config file, with flags applied on top.
    fn build_job(&self, ctx: &Context) -> Result<Job> {
        let mut job = ctx
            .config
            .job(&self.command.join(" "), self.job_type.as_deref())?;

        if let Some(name) = &self.name {
            job.set_name(name)?;
        }
        if let Some(cpu) = self.cpu {
            job.set_cpu(cpu)?;
        }
        if let Some(mem) = &self.mem {
            job.set_mem(mem)?;
        }
        if let Some(time) = &self.time {
            job.set_time(time)?;
        }
        if let Some(queue) = &self.queue {
            job.set_queue(queue)?;
        }
        if let Some(nodes) = self.nodes {
            job.set_nodes(nodes)?;
        }
        if let Some(tasks) = self.tasks {
            job.set_tasks(tasks)?;
        }
        if let Some(path) = &self.output {
            job.set_stdout(path)?;
        }
        if let Some(path) = &self.error {
            job.set_stderr(path)?;
        }
        if let Some(dir) = &self.workdir {
            job.set_workdir(dir);
        }
        for module in &self.modules {
            job.add_module(module)?;
        }
        for resource in &self.resources {
            let (name, value) = resource
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Resource '{resource}' must be name=value"))?;
            match value.parse::<u64>() {
                Ok(count) => job.add_resource(name, count)?,
                Err(_) => job.add_resource(name, value)?,
            }
        }
        for arg in &self.raw_args {
            job.add_raw_arg(arg);
        }
        if self.no_env {
            job.set_inherit_env(false);
        }
        Ok(job)
    }
}

/// Execute the run command.
pub async fn execute(ctx: &Context, args: RunArgs) -> Result<()> {
    let job = args.build_job(ctx)?;
    let array = args
        .array
        .as_deref()
        .map(|range| JobArray::from_range(job.clone(), range))
        .transpose()?;
    let scheduler = ctx.scheduler().await?;

    if args.dry_run {
        print!("{}", scheduler.generate_script(&job, array.as_ref())?);
        return Ok(());
    }

    let options = WaitOptions::default().with_timeout(Duration::from_secs(args.timeout));

    if let Some(array) = array {
        let result = scheduler.submit_array(&array).await?;
        println!(
            "{} Submitted array {} [{}] to {}",
            style("✓").green().bold(),
            style(result.base_id()).yellow(),
            array.range_str(),
            scheduler.name()
        );
        if args.wait {
            for (index, status) in result.wait(options).await? {
                println!("  task {:<6} {}", index, styled_status(status));
            }
        }
        return Ok(());
    }

    if args.interactive {
        let result = scheduler.submit(&job, true).await?;
        let code = result.exit_code().await.unwrap_or(-1);
        if code != 0 {
            anyhow::bail!("Command exited with {code}");
        }
        return Ok(());
    }

    let result = scheduler.submit(&job, false).await?;
    println!(
        "{} Submitted job {} ({}) to {}",
        style("✓").green().bold(),
        style(result.job_id()).yellow(),
        job.name(),
        scheduler.name()
    );

    if args.wait {
        let status = result.wait(options).await?;
        println!("  Status: {}", styled_status(status));
        if let Some(code) = result.exit_code().await {
            println!("  Exit code: {code}");
        }
        if let Some(path) = result.output_path(OutputStream::Stdout).await {
            println!("  Output: {}", style(path.display()).dim());
        }
        if !status.is_success() {
            anyhow::bail!("Job {} finished as {}", result.job_id(), status.name());
        }
    }
    Ok(())
}
