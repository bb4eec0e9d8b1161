//! Detect command implementation.

use anyhow::Result;
use console::style;

use hpcrun_sched::{SystemRunner, detect_scheduler};

use super::common::Context;

/// Execute the detect command.
pub async fn execute(ctx: &Context) -> Result<()> {
    let runner = SystemRunner::new(ctx.config.schedulers.command_timeout());
    let detected = detect_scheduler(&runner).await;

    println!("{} Detected scheduler: {}", style("→").cyan().bold(), style(&detected).green().bold());
    if let Some(requested) = ctx.requested_scheduler() {
        println!("  Configured: {}", style(requested).yellow());
    }

    println!("\n{}", style("Available schedulers:").bold());
    for name in ctx.registry().available_schedulers() {
        let marker = if name == detected { "*" } else { " " };
        println!("  {marker} {name}");
    }
    Ok(())
}
