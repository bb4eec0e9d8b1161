//! Scheduler registry.
//!
//! The [`SchedulerRegistry`] maps scheduler names to factories. It starts
//! out with the built-in backends and can be extended with [`register`].
//!
//! [`register`]: SchedulerRegistry::register

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::command::{CommandRunner, SystemRunner};
use crate::detect::detect_scheduler;
use crate::error::{SchedError, SchedResult};
use crate::local::LocalScheduler;
use crate::pbs::PbsScheduler;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::sge::SgeScheduler;
use crate::slurm::SlurmScheduler;

/// Builds a scheduler from the shared configuration and command runner.
type SchedulerFactory =
    Box<dyn Fn(&SchedulerConfig, Arc<dyn CommandRunner>) -> Arc<dyn Scheduler> + Send + Sync>;

/// Name to factory map for schedulers.
pub struct SchedulerRegistry {
    factories: FxHashMap<String, SchedulerFactory>,
    config: SchedulerConfig,
    runner: Arc<dyn CommandRunner>,
}

impl SchedulerRegistry {
    /// Registry with the built-in schedulers and a [`SystemRunner`].
    pub fn new(config: SchedulerConfig) -> Self {
        let runner = Arc::new(SystemRunner::new(config.command_timeout()));
        Self::with_runner(config, runner)
    }

    /// Registry with the built-in schedulers over a custom runner.
    pub fn with_runner(config: SchedulerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let mut registry = Self {
            factories: FxHashMap::default(),
            config,
            runner,
        };
        registry.register("slurm", |config, runner| {
            Arc::new(SlurmScheduler::with_runner(config, runner))
        });
        registry.register("sge", |config, runner| {
            Arc::new(SgeScheduler::with_runner(config, runner))
        });
        registry.register("pbs", |config, runner| {
            Arc::new(PbsScheduler::with_runner(config, runner))
        });
        registry.register("local", |config, runner| {
            Arc::new(LocalScheduler::with_runner(config, runner))
        });
        registry
    }

    /// Register a scheduler factory, replacing any previous one of that name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn(&SchedulerConfig, Arc<dyn CommandRunner>) -> Arc<dyn Scheduler>
        + Send
        + Sync
        + 'static,
    ) {
        let name = name.into().to_ascii_lowercase();
        debug!("Registering scheduler: {}", name);
        self.factories.insert(name, Box::new(factory));
    }

    /// Create a scheduler by name (case-insensitive).
    pub fn create(&self, name: &str) -> SchedResult<Arc<dyn Scheduler>> {
        let key = name.trim().to_ascii_lowercase();
        self.factories
            .get(&key)
            .map(|factory| factory(&self.config, Arc::clone(&self.runner)))
            .ok_or_else(|| SchedError::UnknownScheduler(name.to_string()))
    }

    /// Create the named scheduler, or the detected one for `None` and `"auto"`.
    pub async fn get_scheduler(&self, name: Option<&str>) -> SchedResult<Arc<dyn Scheduler>> {
        match name.map(str::trim) {
            Some(name) if !name.is_empty() && !name.eq_ignore_ascii_case("auto") => self.create(name),
            _ => {
                let detected = detect_scheduler(&*self.runner).await;
                debug!("Detected scheduler: {}", detected);
                self.create(&detected)
            }
        }
    }

    /// All registered scheduler names, sorted.
    pub fn available_schedulers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_scheduler(&self, name: &str) -> bool {
        self.factories.contains_key(&name.trim().to_ascii_lowercase())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Resolve a scheduler with the default configuration.
///
/// `None` or `"auto"` auto-detects; see [`detect_scheduler`].
pub async fn get_scheduler(name: Option<&str>) -> SchedResult<Arc<dyn Scheduler>> {
    SchedulerRegistry::default().get_scheduler(name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;

    fn registry() -> SchedulerRegistry {
        SchedulerRegistry::with_runner(SchedulerConfig::default(), Arc::new(ScriptedRunner::new()))
    }

    #[test]
    fn test_builtins_registered() {
        let registry = registry();
        assert_eq!(registry.available_schedulers(), ["local", "pbs", "sge", "slurm"]);
        for name in registry.available_schedulers() {
            assert_eq!(registry.create(&name).unwrap().name(), name);
        }
        assert_eq!(registry.create("SLURM").unwrap().name(), "slurm");
    }

    #[test]
    fn test_unknown_scheduler_is_configuration_error() {
        let err = registry().create("lsf").err().unwrap();
        assert!(matches!(err, SchedError::UnknownScheduler(ref n) if n == "lsf"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_register_custom_factory() {
        let mut registry = registry();
        registry.register("Mine", |config, runner| {
            Arc::new(LocalScheduler::with_runner(config, runner))
        });
        assert!(registry.has_scheduler("mine"));
        assert_eq!(registry.create("mine").unwrap().name(), "local");
    }

    #[tokio::test]
    async fn test_explicit_name_skips_detection() {
        let runner = Arc::new(ScriptedRunner::new());
        let registry = SchedulerRegistry::with_runner(SchedulerConfig::default(), runner.clone());
        let scheduler = registry.get_scheduler(Some("sge")).await.unwrap();
        assert_eq!(scheduler.name(), "sge");
        assert!(runner.calls().is_empty());
    }
}
