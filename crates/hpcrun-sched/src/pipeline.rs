//! Named job pipelines with declared dependencies.

use std::sync::Arc;

use futures::future::try_join_all;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{SchedError, SchedResult};
use crate::job::Job;
use crate::result::{JobResult, WaitOptions};
use crate::scheduler::{Scheduler, SchedulerExt};
use crate::status::JobStatus;

/// A job in a pipeline.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub name: String,
    pub job: Job,
    /// Upstream job names, in declaration order.
    pub depends_on: Vec<String>,
    /// Set once the job has been submitted.
    pub result: Option<JobResult>,
}

/// A set of jobs submitted as a unit, each after the jobs it depends on.
///
/// Upstream names must already be part of the pipeline when a job is added,
/// so the graph is acyclic by construction. Whether a downstream job actually
/// runs after an upstream failure is left to the scheduler's dependency
/// enforcement.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    /// Edges point from upstream to downstream.
    dag: DiGraph<PipelineJob, ()>,
    index: FxHashMap<String, NodeIndex>,
    submitted: bool,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dag: DiGraph::new(),
            index: FxHashMap::default(),
            submitted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a job that runs after the named upstream jobs.
    pub fn add(&mut self, name: impl Into<String>, job: Job, depends_on: &[&str]) -> SchedResult<()> {
        let name = name.into();
        if self.submitted {
            return Err(SchedError::Config(format!(
                "pipeline '{}' was already submitted",
                self.name
            )));
        }
        if self.index.contains_key(&name) {
            return Err(SchedError::DuplicateJobName(name));
        }
        let upstream = depends_on
            .iter()
            .map(|dep| {
                self.index
                    .get(*dep)
                    .copied()
                    .ok_or_else(|| SchedError::UnknownDependency(dep.to_string()))
            })
            .collect::<SchedResult<Vec<_>>>()?;

        let node = self.dag.add_node(PipelineJob {
            name: name.clone(),
            job,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            result: None,
        });
        for from in upstream {
            self.dag.update_edge(from, node, ());
        }
        self.index.insert(name, node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PipelineJob> {
        self.index.get(name).and_then(|idx| self.dag.node_weight(*idx))
    }

    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// Names of the jobs that depend directly on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .dag
            .neighbors_directed(*idx, Direction::Outgoing)
            .filter_map(|n| self.dag.node_weight(n).map(|j| j.name.as_str()))
            .collect();
        names.sort_unstable();
        names
    }

    /// Submission order: depth-first, every upstream before its dependents,
    /// ties broken by insertion order.
    pub fn job_order(&self) -> SchedResult<Vec<&str>> {
        Ok(self
            .topological_order()?
            .into_iter()
            .filter_map(|idx| self.dag.node_weight(idx).map(|j| j.name.as_str()))
            .collect())
    }

    fn topological_order(&self) -> SchedResult<Vec<NodeIndex>> {
        if petgraph::algo::is_cyclic_directed(&self.dag) {
            return Err(SchedError::DependencyCycle);
        }
        let mut visited = FxHashSet::default();
        let mut order = Vec::with_capacity(self.dag.node_count());
        for idx in self.dag.node_indices() {
            self.visit(idx, &mut visited, &mut order);
        }
        Ok(order)
    }

    fn visit(&self, idx: NodeIndex, visited: &mut FxHashSet<NodeIndex>, order: &mut Vec<NodeIndex>) {
        if !visited.insert(idx) {
            return;
        }
        for dep in &self.dag[idx].depends_on {
            if let Some(&up) = self.index.get(dep) {
                self.visit(up, visited, order);
            }
        }
        order.push(idx);
    }

    /// Submit every job in dependency order.
    ///
    /// Each job is submitted with the results of its upstream jobs as
    /// dependencies. A pipeline can be submitted once; if a submission
    /// fails, the jobs submitted before it keep their results.
    pub async fn submit(&mut self, scheduler: &Arc<dyn Scheduler>) -> SchedResult<Vec<(String, JobResult)>> {
        if self.submitted {
            return Err(SchedError::Config(format!(
                "pipeline '{}' was already submitted",
                self.name
            )));
        }
        let order = self.topological_order()?;
        self.submitted = true;
        tracing::info!(
            "Submitting pipeline '{}' ({} jobs) to {}",
            self.name,
            order.len(),
            scheduler.name()
        );

        for idx in order {
            let mut job = self.dag[idx].job.clone();
            for dep in &self.dag[idx].depends_on {
                let upstream = self
                    .index
                    .get(dep)
                    .and_then(|up| self.dag[*up].result.clone())
                    .ok_or_else(|| SchedError::UnknownDependency(dep.clone()))?;
                job.add_dependency(upstream);
            }
            let result = scheduler.submit(&job, false).await?;
            tracing::info!(
                "Pipeline '{}': {} -> {}",
                self.name,
                self.dag[idx].name,
                result.job_id()
            );
            self.dag[idx].result = Some(result);
        }
        Ok(self.results())
    }

    /// Results of the submitted jobs, in submission order.
    pub fn results(&self) -> Vec<(String, JobResult)> {
        self.topological_order()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|idx| {
                let node = &self.dag[idx];
                node.result.clone().map(|r| (node.name.clone(), r))
            })
            .collect()
    }

    /// Wait until every submitted job is terminal.
    pub async fn wait(&self, options: WaitOptions) -> SchedResult<Vec<(String, JobStatus)>> {
        let results = self.results();
        let statuses = try_join_all(results.iter().map(|(_, r)| r.wait(options))).await?;
        Ok(results
            .into_iter()
            .map(|(name, _)| name)
            .zip(statuses)
            .collect())
    }

    /// Cancel every submitted job that is still cancellable. Returns how many were.
    pub async fn cancel(&self) -> usize {
        let mut cancelled = 0;
        for (_, result) in self.results() {
            if result.cancel().await {
                cancelled += 1;
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::scheduler::SchedulerConfig;
    use crate::local::LocalScheduler;

    fn job(command: &str) -> Job {
        Job::new(command).unwrap()
    }

    fn local() -> (TempDir, Arc<dyn Scheduler>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::default();
        config.local.output_dir = dir.path().to_path_buf();
        config.local.dependency_poll_ms = 20;
        (dir, Arc::new(LocalScheduler::new(&config)))
    }

    #[test]
    fn test_order_follows_dependencies() {
        let mut pipeline = Pipeline::new("chain");
        pipeline.add("A", job("true"), &[]).unwrap();
        pipeline.add("B", job("true"), &["A"]).unwrap();
        pipeline.add("C", job("true"), &["B"]).unwrap();
        assert_eq!(pipeline.job_order().unwrap(), ["A", "B", "C"]);
        assert_eq!(pipeline.dependents("A"), ["B"]);
    }

    #[test]
    fn test_diamond_visits_once() {
        let mut pipeline = Pipeline::new("diamond");
        pipeline.add("fetch", job("true"), &[]).unwrap();
        pipeline.add("left", job("true"), &["fetch"]).unwrap();
        pipeline.add("right", job("true"), &["fetch"]).unwrap();
        pipeline.add("join", job("true"), &["right", "left"]).unwrap();
        assert_eq!(pipeline.job_order().unwrap(), ["fetch", "left", "right", "join"]);
    }

    #[test]
    fn test_forward_reference_fails_immediately() {
        let mut pipeline = Pipeline::new("bad");
        let err = pipeline.add("B", job("true"), &["A"]).unwrap_err();
        assert!(matches!(err, SchedError::UnknownDependency(ref n) if n == "A"));
        assert!(pipeline.is_empty());

        pipeline.add("A", job("true"), &[]).unwrap();
        assert!(matches!(
            pipeline.add("A", job("true"), &[]),
            Err(SchedError::DuplicateJobName(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_injects_upstream_results() {
        let (_dir, scheduler) = local();
        let mut pipeline = Pipeline::new("etl");
        pipeline.add("extract", job("echo data"), &[]).unwrap();
        pipeline.add("load", job("true"), &["extract"]).unwrap();

        let results = pipeline.submit(&scheduler).await.unwrap();
        let names: Vec<_> = results.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["extract", "load"]);
        let (_, load) = &results[1];
        assert_eq!(load.job().dependencies()[0].job_id(), results[0].1.job_id());

        let options = WaitOptions::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_timeout(Duration::from_secs(20));
        let statuses = pipeline.wait(options).await.unwrap();
        assert!(statuses.iter().all(|(_, s)| *s == JobStatus::Completed));

        assert!(matches!(
            pipeline.submit(&scheduler).await,
            Err(SchedError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_upstream_is_left_to_the_scheduler() {
        let (_dir, scheduler) = local();
        let mut pipeline = Pipeline::new("fragile");
        pipeline.add("first", job("exit 1"), &[]).unwrap();
        pipeline.add("second", job("true"), &["first"]).unwrap();
        pipeline.submit(&scheduler).await.unwrap();

        let options = WaitOptions::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_timeout(Duration::from_secs(20));
        let statuses: FxHashMap<_, _> = pipeline.wait(options).await.unwrap().into_iter().collect();
        assert_eq!(statuses["first"], JobStatus::Failed);
        assert_eq!(statuses["second"], JobStatus::Cancelled);
    }
}
