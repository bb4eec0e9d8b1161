//! Uniform Job Submission for HPC Batch Schedulers
//!
//! This crate submits, monitors and cancels batch jobs through one API,
//! whatever scheduler the cluster runs, and falls back to local child
//! processes where there is none.
//!
//! # Overview
//!
//! A job goes through four stages:
//! 1. **Declaration**: build a [`Job`] directly or from an [`HpcConfig`]; every
//!    attribute is validated when it is set
//! 2. **Rendering**: the adapter turns attributes into directive lines through
//!    its [`ArgTable`] and renders the job script
//! 3. **Submission**: the scheduler CLI is invoked and its identifier wrapped
//!    in a [`JobResult`] or [`ArrayJobResult`]
//! 4. **Monitoring**: results poll the adapter until the job reaches a
//!    terminal [`JobStatus`]
//!
//! # Supported Schedulers
//!
//! | Scheduler | Commands | Arrays | Dependencies |
//! |-----------|----------|--------|--------------|
//! | SLURM | sbatch, squeue, sacct, scontrol, scancel, srun | native | all types |
//! | Grid Engine | qsub, qstat, qacct, qdel, qrsh | native | afterany |
//! | PBS Pro | qsub, qstat, qdel | native | all types |
//! | Local | child processes | simulated | all types, in-process |
//!
//! # Example: Single Job
//!
//! ```ignore
//! use hpcrun_sched::{Job, SchedulerExt, WaitOptions, get_scheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scheduler = get_scheduler(None).await?;
//!
//!     let job = Job::new("python train.py")?
//!         .with_cpu(8)?
//!         .with_mem("16G")?
//!         .with_time("2:00:00")?;
//!
//!     let result = scheduler.submit(&job, false).await?;
//!     let status = result.wait(WaitOptions::default()).await?;
//!     println!("{} finished: {}", result.job_id(), status);
//!     Ok(())
//! }
//! ```
//!
//! # Example: Array
//!
//! ```ignore
//! use hpcrun_sched::{JobArray, SchedulerExt};
//!
//! // Tasks 1, 11, 21, ... 91, at most five at a time.
//! let array = JobArray::from_range(Job::new("./process.sh")?, "1-100:10%5")?;
//! let result = scheduler.submit_array(&array).await?;
//! for (index, status) in result.wait(WaitOptions::default()).await? {
//!     println!("task {index}: {status}");
//! }
//! ```
//!
//! # Example: Pipeline
//!
//! ```ignore
//! use hpcrun_sched::Pipeline;
//!
//! let mut pipeline = Pipeline::new("etl");
//! pipeline.add("extract", Job::new("./extract.sh")?, &[])?;
//! pipeline.add("transform", Job::new("./transform.sh")?, &["extract"])?;
//! pipeline.add("load", Job::new("./load.sh")?, &["transform"])?;
//!
//! pipeline.submit(&scheduler).await?;
//! pipeline.wait(WaitOptions::default()).await?;
//! ```

pub mod array;
pub mod command;
pub mod config;
pub mod dependency;
pub mod descriptor;
pub mod detect;
pub mod error;
pub mod info;
pub mod job;
pub mod local;
pub mod pbs;
pub mod pipeline;
pub mod registry;
pub mod render;
pub mod result;
pub mod scheduler;
pub mod sge;
pub mod slurm;
pub mod status;

// Re-exports
pub use array::{JobArray, split_task_id, task_id};
pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use config::{HpcConfig, JobOverrides, RESET_MARKER, deep_merge};
pub use descriptor::{ArgTable, Attr, SchedulerArg};
pub use detect::{SCHEDULER_ENV, detect_scheduler};
pub use error::{SchedError, SchedResult};
pub use info::{JobFilter, JobInfo};
pub use job::{DependencyType, Job, Resource, ResourceValue};
pub use local::{LocalConfig, LocalScheduler};
pub use pbs::{PbsConfig, PbsScheduler};
pub use pipeline::{Pipeline, PipelineJob};
pub use registry::{SchedulerRegistry, get_scheduler};
pub use render::{BuiltinRenderer, ScriptContext, ScriptRenderer};
pub use result::{ArrayJobResult, INTERACTIVE_JOB_ID, JobResult, WaitOptions};
pub use scheduler::{BackendKind, Scheduler, SchedulerConfig, SchedulerExt};
pub use sge::{SgeConfig, SgeScheduler};
pub use slurm::{SlurmConfig, SlurmScheduler};
pub use status::{JobStatus, OutputStream};
