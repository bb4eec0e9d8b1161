//! Wait command implementation.
//!
//! Poll a job until it reaches a terminal state.

use std::time::{Duration, Instant};

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use super::common::{Context, styled_status};

/// Execute the wait command.
pub async fn execute(ctx: &Context, job_id: &str, timeout: u64, poll: Option<u64>) -> Result<()> {
    let scheduler = ctx.scheduler().await?;
    let interval = poll
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| ctx.config.schedulers.poll_interval());

    println!(
        "{} Waiting for job {} (timeout: {}s)",
        style("→").cyan().bold(),
        style(job_id).dim(),
        timeout
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message("Waiting for job to finish...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let start = Instant::now();
    let limit = Duration::from_secs(timeout);

    loop {
        let status = scheduler.get_status(job_id).await;
        spinner.set_message(format!("Status: {} ...", status.name()));

        if status.is_terminal() {
            spinner.finish_and_clear();
            println!("  Status: {}", styled_status(status).bold());
            if let Some(code) = scheduler.get_exit_code(job_id).await {
                println!("  Exit code: {code}");
            }
            if !status.is_success() {
                anyhow::bail!("Job {job_id} finished as {}", status.name());
            }
            return Ok(());
        }

        if start.elapsed() > limit {
            spinner.finish_and_clear();
            anyhow::bail!(
                "Timeout after {}s. Job {} is still {}. Use 'hpcrun status {}' to check later.",
                timeout,
                job_id,
                status.name(),
                job_id
            );
        }

        tokio::time::sleep(interval).await;
    }
}
