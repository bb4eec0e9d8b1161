//! Execution of external scheduler commands.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{SchedError, SchedResult};

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs scheduler CLIs. Adapters only ever talk to the batch system through this.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program args...` and capture its output.
    async fn output(&self, program: &str, args: &[String]) -> SchedResult<CommandOutput>;

    /// Run `program args...` in the foreground with inherited stdio and return its exit code.
    async fn foreground(&self, program: &str, args: &[String]) -> SchedResult<i32>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, program: &str, args: &[String]) -> SchedResult<CommandOutput> {
        tracing::debug!("running {}", display_command(program, args));

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| SchedError::CommandTimeout {
            command: program.to_string(),
            secs: self.timeout.as_secs(),
        })?
        .map_err(|e| SchedError::CommandFailed {
            command: program.to_string(),
            message: e.to_string(),
        })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn foreground(&self, program: &str, args: &[String]) -> SchedResult<i32> {
        tracing::debug!("running {} in the foreground", display_command(program, args));

        // No timeout: interactive sessions last as long as the user wants.
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| SchedError::CommandFailed {
                command: program.to_string(),
                message: e.to_string(),
            })?;

        Ok(exit_code_of(&status))
    }
}

/// Exit code of a finished process, with signals reported shell-style as `128 + signal`.
pub fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Shell-like rendering of a command line for logs.
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| {
            if a.is_empty() || a.contains(char::is_whitespace) {
                format!("'{a}'")
            } else {
                a.clone()
            }
        }))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a status-style query; any failure degrades to `None`.
///
/// Returns stdout only when the command ran, exited 0 and printed something.
pub(crate) async fn query(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Option<String> {
    match runner.output(program, args).await {
        Ok(out) if out.success() && !out.stdout.trim().is_empty() => Some(out.stdout),
        Ok(out) => {
            tracing::debug!(
                "query {} returned {:?}: {}",
                display_command(program, args),
                out.code,
                out.stderr.trim()
            );
            None
        }
        Err(e) => {
            tracing::debug!("query {} failed: {e}", display_command(program, args));
            None
        }
    }
}

/// Write `script` to a transient file, run `command` with the file's path
/// appended, and return the command's stdout.
///
/// The script file is removed when this returns, whatever the outcome.
pub(crate) async fn submit_script(
    runner: &dyn CommandRunner,
    backend: &str,
    script_dir: &Path,
    script: &str,
    mut command: Vec<String>,
) -> SchedResult<String> {
    tokio::fs::create_dir_all(script_dir).await?;
    let file = tempfile::Builder::new()
        .prefix("hpcrun-")
        .suffix(".sh")
        .tempfile_in(script_dir)?;
    tokio::fs::write(file.path(), script).await?;
    command.push(file.path().to_string_lossy().into_owned());

    let Some((program, args)) = command.split_first() else {
        return Err(SchedError::Config(format!("empty submit command for {backend}")));
    };
    let output = runner
        .output(program, args)
        .await
        .map_err(|e| SchedError::Submission {
            backend: backend.to_string(),
            message: e.to_string(),
        })?;
    drop(file);

    if !output.success() {
        let stderr = output.stderr.trim();
        let message = if stderr.is_empty() {
            format!("{program} exited with {:?}", output.code)
        } else {
            stderr.to_string()
        };
        return Err(SchedError::Submission {
            backend: backend.to_string(),
            message,
        });
    }
    Ok(output.stdout)
}

/// Build an owned argument vector from string slices.
pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted runner for adapter tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Returns canned outputs keyed by program name and records every call.
    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Mutex<Vec<(String, VecDeque<SchedResult<CommandOutput>>)>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a successful response for `program`.
        pub fn ok(self, program: &str, stdout: &str) -> Self {
            self.push(
                program,
                Ok(CommandOutput {
                    code: Some(0),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }),
            )
        }

        /// Queue a non-zero exit for `program`.
        pub fn fail(self, program: &str, code: i32, stderr: &str) -> Self {
            self.push(
                program,
                Ok(CommandOutput {
                    code: Some(code),
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                }),
            )
        }

        /// Queue a spawn failure for `program`.
        pub fn missing(self, program: &str) -> Self {
            self.push(
                program,
                Err(SchedError::CommandFailed {
                    command: program.to_string(),
                    message: "No such file or directory".to_string(),
                }),
            )
        }

        fn push(self, program: &str, response: SchedResult<CommandOutput>) -> Self {
            {
                let mut responses = self.responses.lock().unwrap();
                match responses.iter_mut().find(|(p, _)| p == program) {
                    Some((_, queue)) => queue.push_back(response),
                    None => responses.push((program.to_string(), VecDeque::from([response]))),
                }
            }
            self
        }

        /// Every command line run so far, program first.
        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self, program: &str, args: &[String]) -> SchedResult<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(std::iter::once(program.to_string()).chain(args.iter().cloned()).collect());
            let mut responses = self.responses.lock().unwrap();
            responses
                .iter_mut()
                .find(|(p, _)| p == program)
                .and_then(|(_, queue)| queue.pop_front())
                .unwrap_or_else(|| {
                    Err(SchedError::CommandFailed {
                        command: program.to_string(),
                        message: "no scripted response".to_string(),
                    })
                })
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn output(&self, program: &str, args: &[String]) -> SchedResult<CommandOutput> {
            self.next(program, args)
        }

        async fn foreground(&self, program: &str, args: &[String]) -> SchedResult<i32> {
            self.next(program, args).map(|out| out.code.unwrap_or(-1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedRunner;
    use super::*;

    #[test]
    fn test_display_command() {
        let rendered = display_command("sacct", &args(["-j", "42", "-o", "State Exit"]));
        assert_eq!(rendered, "sacct -j 42 -o 'State Exit'");
    }

    #[tokio::test]
    async fn test_query_degrades_to_none() {
        let runner = ScriptedRunner::new()
            .fail("squeue", 1, "slurm_load_jobs error: Invalid job id specified")
            .ok("squeue", "   \n")
            .missing("squeue")
            .ok("squeue", "RUNNING\n");

        let a = args(["-j", "1"]);
        assert_eq!(query(&runner, "squeue", &a).await, None);
        assert_eq!(query(&runner, "squeue", &a).await, None);
        assert_eq!(query(&runner, "squeue", &a).await, None);
        assert_eq!(query(&runner, "squeue", &a).await.as_deref(), Some("RUNNING\n"));
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_submit_script_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new()
            .ok("sbatch", "42\n")
            .fail("sbatch", 1, "sbatch: error: invalid partition");

        let out = submit_script(&runner, "slurm", dir.path(), "#!/bin/bash\ntrue\n", args(["sbatch"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "42");

        let err = submit_script(&runner, "slurm", dir.path(), "#!/bin/bash\n", args(["sbatch"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Submission { ref message, .. } if message.contains("invalid partition")));

        for call in runner.calls() {
            let script = call.last().unwrap();
            assert!(script.ends_with(".sh"));
            assert!(!Path::new(script).exists());
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::default();
        let out = runner
            .output("sh", &args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemRunner::default();
        let err = runner
            .output("definitely-not-a-scheduler-cli", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemRunner::new(Duration::from_millis(100));
        let err = runner.output("sleep", &args(["5"])).await.unwrap_err();
        assert!(matches!(err, SchedError::CommandTimeout { .. }));
    }
}
