//! Integration tests for the cluster adapters.
//!
//! The batch system is replaced by a fake `CommandRunner` that answers with
//! canned CLI output and keeps a copy of every submitted script.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hpcrun_sched::{
    CommandOutput, CommandRunner, Job, JobArray, JobStatus, PbsScheduler, SchedError, SchedResult,
    Scheduler, SchedulerConfig, SchedulerExt, SgeScheduler, SlurmScheduler, WaitOptions,
};

// ============================================================================
// Fake cluster
// ============================================================================

#[derive(Default)]
struct FakeCluster {
    /// Queued responses per program; the last one repeats when marked sticky.
    responses: Mutex<Vec<(String, VecDeque<CommandOutput>, bool)>>,
    calls: Mutex<Vec<Vec<String>>>,
    scripts: Mutex<Vec<String>>,
}

impl FakeCluster {
    fn new() -> Self {
        Self::default()
    }

    fn reply(self, program: &str, stdout: &str) -> Self {
        self.push(program, 0, stdout, false)
    }

    fn always(self, program: &str, stdout: &str) -> Self {
        self.push(program, 0, stdout, true)
    }

    fn push(self, program: &str, code: i32, stdout: &str, sticky: bool) -> Self {
        let output = CommandOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        self.responses
            .lock()
            .unwrap()
            .push((program.to_string(), VecDeque::from([output]), sticky));
        self
    }

    fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c[0] == program)
            .cloned()
            .collect()
    }

    fn last_script(&self) -> String {
        self.scripts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for FakeCluster {
    async fn output(&self, program: &str, args: &[String]) -> SchedResult<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(std::iter::once(program.to_string()).chain(args.iter().cloned()).collect());

        // Submission commands get the script path last; keep its content.
        if let Some(script) = args.last().filter(|a| a.ends_with(".sh")) {
            if let Ok(text) = std::fs::read_to_string(script) {
                self.scripts.lock().unwrap().push(text);
            }
        }

        let mut responses = self.responses.lock().unwrap();
        let Some(index) = responses.iter().position(|(p, queue, _)| p == program && !queue.is_empty())
        else {
            return Err(SchedError::CommandFailed {
                command: program.to_string(),
                message: "not installed".to_string(),
            });
        };
        let (_, queue, sticky) = &mut responses[index];
        if *sticky {
            return Ok(queue[0].clone());
        }
        let output = queue.pop_front().unwrap();
        Ok(output)
    }

    async fn foreground(&self, program: &str, args: &[String]) -> SchedResult<i32> {
        self.output(program, args).await.map(|o| o.code.unwrap_or(-1))
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        script_dir: std::env::temp_dir(),
        ..SchedulerConfig::default()
    }
}

fn slurm(cluster: FakeCluster) -> (Arc<FakeCluster>, Arc<dyn Scheduler>) {
    let cluster = Arc::new(cluster);
    let scheduler: Arc<dyn Scheduler> =
        Arc::new(SlurmScheduler::with_runner(&config(), cluster.clone()));
    (cluster, scheduler)
}

fn position(script: &str, needle: &str) -> usize {
    script
        .find(needle)
        .unwrap_or_else(|| panic!("'{needle}' missing from script:\n{script}"))
}

fn sized_job() -> Job {
    Job::new("python train.py")
        .unwrap()
        .with_name("train")
        .unwrap()
        .with_cpu(8)
        .unwrap()
        .with_mem("16G")
        .unwrap()
}

// ============================================================================
// Script rendering
// ============================================================================

#[test]
fn test_slurm_directives_follow_attribute_order() {
    let (_, scheduler) = slurm(FakeCluster::new());
    let script = scheduler.generate_script(&sized_job(), None).unwrap();

    assert!(script.starts_with("#!/bin/bash\n"));
    let first = script.lines().find(|l| l.starts_with("#SBATCH")).unwrap();
    assert_eq!(first, "#SBATCH --cpus-per-task=8");
    assert_eq!(script.matches("--cpus-per-task").count(), 1);
    assert_eq!(script.matches("--mem=").count(), 1);
    let cpu = position(&script, "#SBATCH --cpus-per-task=8");
    let mem = position(&script, "#SBATCH --mem=16G");
    let name = position(&script, "#SBATCH --job-name=train");
    let export = position(&script, "#SBATCH --export=ALL");
    let command = position(&script, "python train.py");
    assert!(cpu < mem && mem < name && name < export && export < command);
}

#[test]
fn test_sge_directives_and_missing_descriptor() {
    let scheduler = SgeScheduler::with_runner(&config(), Arc::new(FakeCluster::new()));
    let script = scheduler.generate_script(&sized_job(), None).unwrap();

    let cpu = position(&script, "#$ -pe smp 8");
    let mem = position(&script, "#$ -l mem_free=16G");
    let shell = position(&script, "#$ -S /bin/bash");
    assert!(cpu < mem && mem < shell);

    let job = sized_job().with_nodes(2).unwrap();
    let err = scheduler.generate_script(&job, None).unwrap_err();
    assert!(matches!(err, SchedError::Unsupported { ref backend, .. } if backend == "sge"));
}

#[test]
fn test_array_range_on_every_cluster_backend() {
    let array = JobArray::from_range(Job::new("./task.sh").unwrap(), "1-100:10%5").unwrap();
    assert_eq!(array.len(), 10);
    assert_eq!(array.indices().last(), Some(91));

    let (_, slurm) = slurm(FakeCluster::new());
    let script = slurm.generate_script(array.job(), Some(&array)).unwrap();
    assert!(script.contains("#SBATCH --array=1-100:10%5\n"));

    let sge = SgeScheduler::with_runner(&config(), Arc::new(FakeCluster::new()));
    let script = sge.generate_script(array.job(), Some(&array)).unwrap();
    assert!(script.contains("#$ -t 1-100:10\n"));
    assert!(script.contains("#$ -tc 5\n"));

    let pbs = PbsScheduler::with_runner(&config(), Arc::new(FakeCluster::new()));
    let script = pbs.generate_script(array.job(), Some(&array)).unwrap();
    assert!(script.contains("#PBS -J 1-100:10\n"));
    assert!(script.contains("#PBS -W max_run_subjobs=5\n"));
}

// ============================================================================
// Submission and status
// ============================================================================

#[tokio::test]
async fn test_submit_sends_rendered_script() {
    let (cluster, scheduler) = slurm(FakeCluster::new().reply("sbatch", "4242\n"));
    let result = scheduler.submit(&sized_job(), false).await.unwrap();

    assert_eq!(result.job_id(), "4242");
    assert_eq!(result.scheduler_name(), "slurm");
    let sbatch = &cluster.calls_to("sbatch")[0];
    assert_eq!(&sbatch[..2], ["sbatch", "--parsable"]);
    assert!(cluster.last_script().contains("#SBATCH --mem=16G"));
}

#[tokio::test]
async fn test_failed_queries_degrade_to_unknown() {
    let (_, scheduler) = slurm(FakeCluster::new().reply("sbatch", "77\n"));
    let result = scheduler.submit(&sized_job(), false).await.unwrap();

    assert_eq!(result.status().await, JobStatus::Unknown);
    assert_eq!(result.exit_code().await, None);
    assert_eq!(result.output_path(hpcrun_sched::OutputStream::Stdout).await, None);
}

#[tokio::test]
async fn test_terminal_status_is_sticky() {
    let (cluster, scheduler) = slurm(
        FakeCluster::new()
            .reply("sbatch", "78\n")
            .reply("squeue", "")
            .reply("sacct", "COMPLETED\n"),
    );
    let result = scheduler.submit(&sized_job(), false).await.unwrap();

    assert_eq!(result.status().await, JobStatus::Completed);
    // No more canned answers: a fresh query would report UNKNOWN.
    assert_eq!(result.status().await, JobStatus::Completed);
    assert!(result.is_complete().await);
    assert_eq!(cluster.calls_to("sacct").len(), 1);
}

#[tokio::test]
async fn test_wait_timeout_is_not_a_job_timeout() {
    let (_, scheduler) = slurm(
        FakeCluster::new()
            .reply("sbatch", "79\n")
            .always("squeue", "RUNNING\n"),
    );
    let result = scheduler.submit(&sized_job(), false).await.unwrap();

    let options = WaitOptions::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_timeout(Duration::from_millis(50));
    let err = result.wait(options).await.unwrap_err();
    assert!(matches!(err, SchedError::TimeoutExceeded { ref job_id, .. } if job_id == "79"));
    assert_eq!(result.status().await, JobStatus::Running);
}

#[tokio::test]
async fn test_array_submission_addresses_tasks_uniformly() {
    let (_, scheduler) = slurm(FakeCluster::new().reply("sbatch", "900\n"));
    let array = JobArray::from_range(Job::new("./task.sh").unwrap(), "1-100:10%5").unwrap();
    let result = scheduler.submit_array(&array).await.unwrap();

    assert_eq!(result.base_id(), "900");
    let ids = result.task_ids();
    assert_eq!(ids.len(), 10);
    assert_eq!(ids[0], "900_1");
    assert_eq!(ids[9], "900_91");
    assert!(result.task(2).is_none());
    assert_eq!(result.task(11).unwrap().job_id(), "900_11");
}

#[tokio::test]
async fn test_submission_error_is_surfaced() {
    let cluster = FakeCluster::new().push("sbatch", 1, "", false);
    let (_, scheduler) = slurm(cluster);
    let err = scheduler.submit(&sized_job(), false).await.unwrap_err();
    assert!(matches!(err, SchedError::Submission { ref backend, .. } if backend == "slurm"));
}
