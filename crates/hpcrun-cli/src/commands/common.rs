//! Shared helpers for CLI commands.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use console::{StyledObject, style};

use hpcrun_sched::{HpcConfig, JobStatus, Scheduler, SchedulerRegistry};

/// Configuration and scheduler selection for one CLI invocation.
pub struct Context {
    pub config: HpcConfig,
    scheduler: Option<String>,
    registry: SchedulerRegistry,
}

impl Context {
    /// Load the optional YAML config. A `--scheduler` flag beats the file.
    pub fn load(path: Option<&Path>, scheduler: Option<&str>) -> Result<Self> {
        let config = match path {
            Some(path) => load_config(path)?,
            None => HpcConfig::default(),
        };
        let scheduler = scheduler
            .map(str::to_string)
            .or_else(|| config.scheduler.clone());
        let registry = SchedulerRegistry::new(config.schedulers.clone());
        Ok(Self {
            config,
            scheduler,
            registry,
        })
    }

    /// The selected scheduler, auto-detected when none was named.
    pub async fn scheduler(&self) -> Result<Arc<dyn Scheduler>> {
        self.registry
            .get_scheduler(self.scheduler.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("Cannot select scheduler: {e}"))
    }

    pub fn registry(&self) -> &SchedulerRegistry {
        &self.registry
    }

    pub fn requested_scheduler(&self) -> Option<&str> {
        self.scheduler.as_deref()
    }
}

/// Parse an [`HpcConfig`] from a YAML file.
pub fn load_config(path: &Path) -> Result<HpcConfig> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    let source = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&source).with_context(|| format!("Invalid config file: {}", path.display()))
}

pub fn parse_config(source: &str) -> Result<HpcConfig> {
    if source.trim().is_empty() {
        return Ok(HpcConfig::default());
    }
    Ok(serde_yaml_ng::from_str(source)?)
}

/// Status name coloured by outcome.
pub fn styled_status(status: JobStatus) -> StyledObject<&'static str> {
    let name = status.name();
    match status {
        JobStatus::Completed => style(name).green(),
        JobStatus::Failed | JobStatus::Timeout | JobStatus::Cancelled => style(name).red(),
        JobStatus::Pending => style(name).yellow(),
        _ => style(name).cyan(),
    }
}
