//! Integration tests running real child processes through the local backend.

use std::sync::Arc;
use std::time::Duration;

use hpcrun_sched::{
    DependencyType, Job, JobArray, JobStatus, LocalScheduler, OutputStream, Pipeline, SchedError,
    Scheduler, SchedulerConfig, SchedulerExt, WaitOptions,
};
use tempfile::TempDir;

fn local() -> (TempDir, Arc<dyn Scheduler>) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SchedulerConfig::default();
    config.local.output_dir = dir.path().to_path_buf();
    config.local.dependency_poll_ms = 20;
    (dir, Arc::new(LocalScheduler::new(&config)))
}

fn quick() -> WaitOptions {
    WaitOptions::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_timeout(Duration::from_secs(30))
}

#[tokio::test]
async fn test_cancel_live_and_absent_jobs() {
    let (_dir, scheduler) = local();
    assert!(!scheduler.cancel("local-does-not-exist").await);

    let result = scheduler
        .submit(&Job::new("sleep 30").unwrap(), false)
        .await
        .unwrap();
    assert!(result.cancel().await);
    assert_eq!(result.wait(quick()).await.unwrap(), JobStatus::Cancelled);
    assert!(!result.cancel().await);
}

#[test]
fn test_background_job_outlives_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("done.marker");
    let mut config = SchedulerConfig::default();
    config.local.output_dir = dir.path().to_path_buf();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let status = runtime.block_on(async {
        let scheduler: Arc<dyn Scheduler> = Arc::new(LocalScheduler::new(&config));
        let job = Job::new(format!("sleep 0.3; touch {}", marker.display())).unwrap();
        let result = scheduler.submit(&job, false).await.unwrap();
        result.status().await
    });
    drop(runtime);
    assert_eq!(status, JobStatus::Running);

    for _ in 0..100 {
        if marker.exists() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(marker.exists());
}

#[tokio::test]
async fn test_output_and_exit_code() {
    let (_dir, scheduler) = local();
    let job = Job::new("echo hello; echo oops >&2; exit 4")
        .unwrap()
        .with_stderr("errors.log")
        .unwrap();
    let result = scheduler.submit(&job, false).await.unwrap();

    assert_eq!(result.wait(quick()).await.unwrap(), JobStatus::Failed);
    assert_eq!(result.exit_code().await, Some(4));
    assert_eq!(result.read_output(OutputStream::Stdout).await.unwrap(), "hello\n");
    assert_eq!(result.read_output(OutputStream::Stderr).await.unwrap(), "oops\n");
}

#[tokio::test]
async fn test_array_tasks_see_their_index() {
    let (_dir, scheduler) = local();
    let job = Job::new("echo task-$HPC_ARRAY_TASK_ID").unwrap().with_name("arr").unwrap();
    let array = JobArray::from_range(job, "2-6:2%2").unwrap();
    let result = scheduler.submit_array(&array).await.unwrap();

    let statuses = result.wait(quick()).await.unwrap();
    assert_eq!(
        statuses.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
        [2, 4, 6]
    );
    assert!(statuses.iter().all(|(_, s)| *s == JobStatus::Completed));
    for index in [2, 4, 6] {
        let task = result.task(index).unwrap();
        let text = task.read_output(OutputStream::Stdout).await.unwrap();
        assert_eq!(text, format!("task-{index}\n"));
    }
}

#[tokio::test]
async fn test_pipeline_runs_in_dependency_order() {
    let (dir, scheduler) = local();
    let log = dir.path().join("order.log");
    let append = |word: &str| Job::new(format!("echo {word} >> '{}'", log.display())).unwrap();

    let mut pipeline = Pipeline::new("abc");
    pipeline.add("A", append("a"), &[]).unwrap();
    pipeline.add("B", append("b"), &["A"]).unwrap();
    pipeline.add("C", append("c"), &["B"]).unwrap();
    assert_eq!(pipeline.job_order().unwrap(), ["A", "B", "C"]);

    pipeline.submit(&scheduler).await.unwrap();
    let statuses = pipeline.wait(quick()).await.unwrap();
    assert!(statuses.iter().all(|(_, s)| *s == JobStatus::Completed));
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "a\nb\nc\n");
}

#[test]
fn test_pipeline_rejects_forward_reference() {
    let mut pipeline = Pipeline::new("broken");
    pipeline.add("A", Job::new("true").unwrap(), &[]).unwrap();
    let err = pipeline
        .add("C", Job::new("true").unwrap(), &["B"])
        .unwrap_err();
    assert!(matches!(err, SchedError::UnknownDependency(ref name) if name == "B"));
    assert!(err.is_configuration());
    assert_eq!(pipeline.len(), 1);
}

#[tokio::test]
async fn test_afternotok_runs_only_after_failure() {
    let (_dir, scheduler) = local();
    let ok = scheduler.submit(&Job::new("true").unwrap(), false).await.unwrap();
    let bad = scheduler.submit(&Job::new("false").unwrap(), false).await.unwrap();

    let cleanup = |upstream| {
        Job::new("echo cleanup")
            .unwrap()
            .with_dependency(upstream)
            .with_dependency_type(DependencyType::AfterNotOk)
    };
    let skipped = scheduler.submit(&cleanup(ok), false).await.unwrap();
    let ran = scheduler.submit(&cleanup(bad), false).await.unwrap();

    assert_eq!(skipped.wait(quick()).await.unwrap(), JobStatus::Cancelled);
    assert_eq!(ran.wait(quick()).await.unwrap(), JobStatus::Completed);
}

#[tokio::test]
async fn test_dry_run_script_for_local() {
    let (_dir, scheduler) = local();
    let job = Job::new("make all").unwrap().with_module("gcc/12").unwrap();
    let script = scheduler.generate_script(&job, None).unwrap();
    assert!(script.starts_with("#!/bin/bash\n"));
    assert!(script.contains("module load gcc/12\n"));
    assert!(script.trim_end().ends_with("make all"));
}
