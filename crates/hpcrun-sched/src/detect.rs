//! Scheduler auto-detection.

use std::path::Path;

use crate::command::{CommandRunner, args};

/// Environment variable that forces a scheduler by name.
pub const SCHEDULER_ENV: &str = "HPC_SCHEDULER";

/// Pick the scheduler available on this host.
///
/// Precedence: `HPC_SCHEDULER`, then Grid Engine (`qsub` on `PATH` and either
/// `SGE_ROOT` set or `qstat -help` naming Grid Engine), then SLURM (`sbatch`
/// and `squeue` on `PATH`), then PBS (`qsub` on `PATH` and `PBS_CONF_FILE`
/// set), else `local`.
pub async fn detect_scheduler(runner: &dyn CommandRunner) -> String {
    detect_with(|key| std::env::var(key).ok(), runner).await
}

/// [`detect_scheduler`] over an explicit environment lookup.
pub async fn detect_with<E>(env: E, runner: &dyn CommandRunner) -> String
where
    E: Fn(&str) -> Option<String>,
{
    if let Some(forced) = env(SCHEDULER_ENV).filter(|v| !v.trim().is_empty()) {
        let name = forced.trim().to_ascii_lowercase();
        tracing::debug!("{SCHEDULER_ENV} selects {name}");
        return name;
    }

    let path = env("PATH").unwrap_or_default();
    let on_path = |program: &str| find_program(&path, program);

    if on_path("qsub") && (env("SGE_ROOT").is_some() || qstat_is_grid_engine(runner).await) {
        return "sge".to_string();
    }
    if on_path("sbatch") && on_path("squeue") {
        return "slurm".to_string();
    }
    if on_path("qsub") && env("PBS_CONF_FILE").is_some() {
        return "pbs".to_string();
    }
    "local".to_string()
}

/// Whether `program` is a file in one of the `PATH` entries.
fn find_program(path: &str, program: &str) -> bool {
    std::env::split_paths(path).any(|dir| is_executable(&dir.join(program)))
}

#[cfg(unix)]
fn is_executable(candidate: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    candidate
        .metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(candidate: &Path) -> bool {
    candidate.is_file()
}

async fn qstat_is_grid_engine(runner: &dyn CommandRunner) -> bool {
    match runner.output("qstat", &args(["-help"])).await {
        Ok(out) => {
            let text = format!("{}{}", out.stdout, out.stderr);
            text.contains("SGE") || text.contains("Grid Engine")
        }
        Err(e) => {
            tracing::debug!("qstat -help failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::command::testing::ScriptedRunner;

    fn bin_dir(programs: &[&str]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for program in programs {
            let path = dir.path().join(program);
            std::fs::write(&path, "#!/bin/sh\n").unwrap();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
        }
        dir
    }

    async fn detect(vars: &[(&str, &str)], runner: &ScriptedRunner) -> String {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        detect_with(|key| vars.get(key).cloned(), runner).await
    }

    #[tokio::test]
    async fn test_env_override_wins() {
        let runner = ScriptedRunner::new();
        assert_eq!(detect(&[("HPC_SCHEDULER", "SLURM")], &runner).await, "slurm");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sge_before_slurm() {
        let bin = bin_dir(&["qsub", "sbatch", "squeue"]);
        let path = bin.path().to_str().unwrap();
        let runner = ScriptedRunner::new();
        assert_eq!(
            detect(&[("PATH", path), ("SGE_ROOT", "/opt/sge")], &runner).await,
            "sge"
        );

        let runner = ScriptedRunner::new().ok("qstat", "usage: qstat [options]\n");
        assert_eq!(detect(&[("PATH", path)], &runner).await, "slurm");
    }

    #[tokio::test]
    async fn test_qstat_help_identifies_grid_engine() {
        let bin = bin_dir(&["qsub", "qstat"]);
        let runner = ScriptedRunner::new().ok("qstat", "SGE 8.1.9\nusage: qstat [options]\n");
        let path = bin.path().to_str().unwrap();
        assert_eq!(detect(&[("PATH", path)], &runner).await, "sge");
    }

    #[tokio::test]
    async fn test_pbs_and_fallback() {
        let bin = bin_dir(&["qsub"]);
        let path = bin.path().to_str().unwrap();
        let runner = ScriptedRunner::new().missing("qstat");
        assert_eq!(
            detect(&[("PATH", path), ("PBS_CONF_FILE", "/etc/pbs.conf")], &runner).await,
            "pbs"
        );
        assert_eq!(detect(&[("PATH", path)], &runner).await, "local");
        assert_eq!(detect(&[], &runner).await, "local");
    }
}
