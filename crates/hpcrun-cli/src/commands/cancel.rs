//! Cancel command implementation.

use anyhow::Result;
use console::style;

use super::common::Context;

/// Execute the cancel command. Fails if any job could not be cancelled.
pub async fn execute(ctx: &Context, job_ids: &[String]) -> Result<()> {
    let scheduler = ctx.scheduler().await?;

    let mut missed = Vec::new();
    for job_id in job_ids {
        if scheduler.cancel(job_id).await {
            println!("{} Cancelled {}", style("✓").green().bold(), style(job_id).yellow());
        } else {
            println!("{} Nothing to cancel for {}", style("✗").red().bold(), style(job_id).dim());
            missed.push(job_id.as_str());
        }
    }

    if !missed.is_empty() {
        anyhow::bail!("Could not cancel: {}", missed.join(", "));
    }
    Ok(())
}
