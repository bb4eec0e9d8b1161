//! Translation of job dependencies into backend syntax.

use crate::error::{SchedError, SchedResult};
use crate::job::{DependencyType, Job};
use crate::result::{JobResult, WaitOptions};
use crate::scheduler::BackendKind;
use crate::status::JobStatus;

/// Identifiers of the upstream jobs a backend can wait on.
///
/// Interactive runs have already finished and have no pollable id, so they
/// are left out.
pub fn upstream_ids(job: &Job) -> Vec<&str> {
    job.dependencies()
        .iter()
        .filter(|d| !d.is_interactive())
        .map(JobResult::job_id)
        .collect()
}

/// Whether `backend` can express `dependency_type` natively.
///
/// SGE's `-hold_jid` releases a job once its upstream jobs leave the queue,
/// whatever their exit status, so it only carries `afterany`.
pub fn supports(backend: BackendKind, dependency_type: DependencyType) -> bool {
    match backend {
        BackendKind::Slurm | BackendKind::Pbs | BackendKind::Local => true,
        BackendKind::Sge => dependency_type == DependencyType::AfterAny,
    }
}

/// The directive body (without comment prefix) for the job's dependencies.
///
/// `None` when the job has nothing to wait on. The local backend enforces
/// dependencies itself and never renders one.
pub fn render(backend: BackendKind, job: &Job) -> SchedResult<Option<String>> {
    let ids = upstream_ids(job);
    if ids.is_empty() {
        return Ok(None);
    }
    let dependency_type = job.dependency_type();
    if !supports(backend, dependency_type) {
        return Err(SchedError::unsupported(
            backend.name(),
            format!("dependency type '{dependency_type}'"),
        ));
    }

    let body = match backend {
        BackendKind::Slurm => format!("--dependency={dependency_type}:{}", ids.join(":")),
        BackendKind::Pbs => format!("-W depend={dependency_type}:{}", ids.join(":")),
        BackendKind::Sge => format!("-hold_jid {}", ids.join(",")),
        BackendKind::Local => return Ok(None),
    };
    Ok(Some(body))
}

/// Wait for the upstream jobs and decide whether a dependent job may run.
///
/// `after` only requires the upstream jobs to have been submitted, which is
/// already true by the time the dependent job exists.
pub(crate) async fn gate_satisfied(
    dependency_type: DependencyType,
    upstream: &[JobResult],
    poll: WaitOptions,
) -> bool {
    if upstream.is_empty() || dependency_type == DependencyType::After {
        return true;
    }

    let mut statuses = Vec::with_capacity(upstream.len());
    for result in upstream {
        match result.wait(poll).await {
            Ok(status) => statuses.push(status),
            Err(e) => {
                tracing::warn!("Giving up on dependency {}: {e}", result.job_id());
                statuses.push(JobStatus::Unknown);
            }
        }
    }
    evaluate(dependency_type, &statuses)
}

/// Decide a dependency gate from the final upstream statuses.
pub(crate) fn evaluate(dependency_type: DependencyType, statuses: &[JobStatus]) -> bool {
    match dependency_type {
        DependencyType::After | DependencyType::AfterAny => true,
        DependencyType::AfterOk => statuses.iter().all(JobStatus::is_success),
        DependencyType::AfterNotOk => statuses.iter().any(|s| !s.is_success()),
    }
}
