//! Status command implementation.
//!
//! Show one job in detail, or list the scheduler's jobs.

use anyhow::Result;
use console::style;

use hpcrun_sched::{JobFilter, JobInfo, SchedError};

use super::common::{Context, styled_status};

/// Execute the status command.
pub async fn execute(
    ctx: &Context,
    job_id: Option<&str>,
    all: bool,
    history: bool,
    user: Option<&str>,
) -> Result<()> {
    let scheduler = ctx.scheduler().await?;

    if all || history {
        let filter = match user {
            Some(user) => JobFilter::for_user(user),
            None => JobFilter::default(),
        };
        let mut jobs = scheduler
            .list_active_jobs(&filter)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list jobs: {e}"))?;
        if history {
            match scheduler.list_completed_jobs(&filter).await {
                Ok(finished) => jobs.extend(finished),
                Err(SchedError::Unsupported { .. }) => {
                    println!(
                        "{} {} keeps no job history",
                        style("!").yellow().bold(),
                        scheduler.name()
                    );
                }
                Err(e) => anyhow::bail!("Failed to list finished jobs: {e}"),
            }
        }
        print_table(&jobs);
        return Ok(());
    }

    let job_id = job_id
        .ok_or_else(|| anyhow::anyhow!("Please provide a job ID or use --all to list jobs"))?;

    match scheduler.get_job_details(job_id).await {
        Ok(info) => print_details(&info),
        Err(SchedError::JobNotFound(_)) => {
            println!(
                "{} Job {} status: {}",
                style("→").cyan().bold(),
                style(job_id).dim(),
                styled_status(scheduler.get_status(job_id).await)
            );
        }
        Err(e) => anyhow::bail!("Failed to get status: {e}"),
    }
    Ok(())
}

fn print_table(jobs: &[JobInfo]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }

    println!("{} {} job(s):\n", style("→").cyan().bold(), jobs.len());
    println!(
        "  {:<16}  {:<20}  {:<10}  {:<10}  {:<12}  {}",
        style("JOB ID").bold(),
        style("NAME").bold(),
        style("STATUS").bold(),
        style("QUEUE").bold(),
        style("RESOURCES").bold(),
        style("RUNTIME").bold()
    );
    println!("  {}", "-".repeat(84));

    for job in jobs {
        println!(
            "  {:<16}  {:<20}  {:<10}  {:<10}  {:<12}  {}",
            style(&job.job_id).dim(),
            job.name.as_deref().unwrap_or("-"),
            styled_status(job.status),
            job.queue.as_deref().unwrap_or("-"),
            job.resources_display(),
            job.runtime_display(),
        );
    }
}

fn print_details(info: &JobInfo) {
    println!(
        "{} Job {} status: {}",
        style("→").cyan().bold(),
        style(&info.job_id).dim(),
        styled_status(info.status).bold()
    );
    if let Some(name) = &info.name {
        println!("  Name: {name}");
    }
    if let Some(user) = &info.user {
        println!("  User: {user}");
    }
    if let Some(queue) = &info.queue {
        println!("  Queue: {queue}");
    }
    if let Some(node) = &info.node {
        println!("  Node: {node}");
    }
    println!("  Resources: {}", info.resources_display());
    println!("  Runtime: {}", info.runtime_display());
    if let Some(code) = info.exit_code {
        println!("  Exit code: {code}");
    }
    if let Some(path) = &info.stdout_path {
        println!("  Stdout: {}", style(path.display()).dim());
    }
    if let Some(path) = &info.stderr_path {
        println!("  Stderr: {}", style(path.display()).dim());
    }
}
