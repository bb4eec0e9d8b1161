//! Job script rendering.

use std::fmt::Write as _;

use crate::error::{SchedError, SchedResult};
use crate::job::Job;

/// Everything a template needs to produce a job script.
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    pub job: &'a Job,
    /// Name of the scheduler the script is for.
    pub scheduler: &'a str,
    /// Complete directive lines, already prefixed.
    pub directives: Vec<String>,
}

/// Turns a job and its directive block into script text.
pub trait ScriptRenderer: Send + Sync {
    /// Render `template` for `context`. Unknown templates are an error.
    fn render(&self, template: &str, context: &ScriptContext<'_>) -> SchedResult<String>;
}

/// The templates shipped with the crate: `slurm`, `sge`, `pbs` and `local`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinRenderer;

impl BuiltinRenderer {
    pub const TEMPLATES: [&'static str; 4] = ["slurm", "sge", "pbs", "local"];
}

impl ScriptRenderer for BuiltinRenderer {
    fn render(&self, template: &str, context: &ScriptContext<'_>) -> SchedResult<String> {
        // PBS starts jobs in $HOME, so fall back to the submission directory.
        let default_cd = match template {
            "slurm" | "sge" | "local" => None,
            "pbs" => Some("cd \"${PBS_O_WORKDIR:-$PWD}\""),
            other => return Err(SchedError::TemplateNotFound(other.to_string())),
        };
        let job = context.job;

        let mut script = String::from("#!/bin/bash\n");
        for line in &context.directives {
            script.push_str(line);
            script.push('\n');
        }
        script.push('\n');
        script.push_str("set -e\n");

        if !job.modules_path().is_empty() || !job.modules().is_empty() {
            script.push('\n');
            for path in job.modules_path() {
                let _ = writeln!(script, "module use {}", shell_quote(path));
            }
            for module in job.modules() {
                let _ = writeln!(script, "module load {module}");
            }
        }

        script.push('\n');
        match (job.workdir(), default_cd) {
            (Some(dir), _) => {
                let _ = writeln!(script, "cd {}", shell_quote(&dir.to_string_lossy()));
            }
            (None, Some(cd)) => {
                let _ = writeln!(script, "{cd}");
            }
            (None, None) => {}
        }
        script.push_str(job.command());
        script.push('\n');
        Ok(script)
    }
}

/// Ordered directive lines sharing one comment prefix (`#SBATCH`, `#$`, `#PBS`).
#[derive(Debug, Clone)]
pub(crate) struct DirectiveBlock {
    prefix: &'static str,
    lines: Vec<String>,
}

impl DirectiveBlock {
    pub(crate) fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            lines: Vec::new(),
        }
    }

    /// Append `{prefix} {body}`.
    pub(crate) fn push(&mut self, body: impl AsRef<str>) {
        self.lines.push(format!("{} {}", self.prefix, body.as_ref()));
    }

    /// Append already-prefixed lines.
    pub(crate) fn extend(&mut self, lines: impl IntoIterator<Item = String>) {
        self.lines.extend(lines);
    }

    /// Append one directive per passthrough argument.
    pub(crate) fn raw(&mut self, args: &[String]) {
        for arg in args {
            self.push(arg);
        }
    }

    pub(crate) fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Quote `value` for a POSIX shell when it needs it.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
