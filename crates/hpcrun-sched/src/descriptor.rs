//! Declarative mapping from job attributes to scheduler flags and directives.
//!
//! Each backend owns an [`ArgTable`]: one [`SchedulerArg`] per logical
//! attribute it understands. A descriptor knows how to validate a value, how
//! to convert it to the backend's spelling, how to render it as command-line
//! tokens and as an in-script directive, and what to emit when the value is
//! absent.

use std::fmt;

use crate::error::{SchedError, SchedResult};
use crate::job::Job;

/// Logical job attributes that map onto scheduler flags.
///
/// The declaration order is the directive emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    Cpu,
    Mem,
    Time,
    Queue,
    Nodes,
    Tasks,
    Name,
    Stdout,
    Stderr,
}

impl Attr {
    /// Directive emission order.
    pub const ORDER: [Attr; 9] = [
        Attr::Cpu,
        Attr::Mem,
        Attr::Time,
        Attr::Queue,
        Attr::Nodes,
        Attr::Tasks,
        Attr::Name,
        Attr::Stdout,
        Attr::Stderr,
    ];

    /// Field name, as used in configuration files and error messages.
    pub fn key(self) -> &'static str {
        match self {
            Attr::Cpu => "cpu",
            Attr::Mem => "mem",
            Attr::Time => "time",
            Attr::Queue => "queue",
            Attr::Nodes => "nodes",
            Attr::Tasks => "tasks",
            Attr::Name => "name",
            Attr::Stdout => "stdout",
            Attr::Stderr => "stderr",
        }
    }

    /// The value type this attribute carries.
    pub fn kind(self) -> ValueKind {
        match self {
            Attr::Cpu | Attr::Nodes | Attr::Tasks => ValueKind::Count,
            Attr::Mem => ValueKind::Memory,
            Attr::Time => ValueKind::Walltime,
            Attr::Queue | Attr::Name => ValueKind::Identifier,
            Attr::Stdout | Attr::Stderr => ValueKind::Path,
        }
    }

    /// Validate a value for this attribute.
    pub fn validate(self, value: &str) -> SchedResult<()> {
        self.kind().validate(self.key(), value)
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Value types shared by attributes across all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Positive integer (CPUs, nodes, tasks).
    Count,
    /// Integer size with an optional K/M/G/T/P unit (`16G`, `4096M`, `4gb`).
    Memory,
    /// `MM`, `MM:SS`, `HH:MM:SS`, `D-HH`, `D-HH:MM` or `D-HH:MM:SS`.
    Walltime,
    /// Non-empty token without whitespace (queue and job names).
    Identifier,
    /// Non-empty single-line path template.
    Path,
}

impl ValueKind {
    /// Validate `value`, naming `field` in the error.
    pub fn validate(self, field: &str, value: &str) -> SchedResult<()> {
        let ok = match self {
            ValueKind::Count => parse_count(value).is_some(),
            ValueKind::Memory => parse_memory_mb(value).is_some(),
            ValueKind::Walltime => parse_walltime_secs(value).is_some(),
            ValueKind::Identifier => {
                !value.is_empty() && !value.chars().any(|c| c.is_whitespace() || c.is_control())
            }
            ValueKind::Path => !value.trim().is_empty() && !value.contains(['\n', '\r']),
        };
        if ok {
            Ok(())
        } else {
            Err(SchedError::validation(field, self.expectation(value)))
        }
    }

    fn expectation(self, value: &str) -> String {
        let expected = match self {
            ValueKind::Count => "a positive integer",
            ValueKind::Memory => "a size like 512M, 16G or 4gb",
            ValueKind::Walltime => "a duration like 30, 01:30:00 or 2-12:00:00",
            ValueKind::Identifier => "a non-empty name without whitespace",
            ValueKind::Path => "a non-empty single-line path",
        };
        format!("expected {expected}, got '{value}'")
    }
}

/// Parse a positive integer count.
pub fn parse_count(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok().filter(|n| *n > 0)
}

/// Parse a memory size into megabytes. A bare number means megabytes.
pub fn parse_memory_mb(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let unit = unit.trim().to_ascii_uppercase();
    let unit = unit.strip_suffix('B').unwrap_or(&unit);
    let unit = unit.strip_suffix('I').unwrap_or(unit);
    let factor = match unit {
        "K" => return Some(amount.div_ceil(1024)),
        "" | "M" => 1,
        "G" => 1024,
        "T" => 1024 * 1024,
        "P" => 1024 * 1024 * 1024,
        _ => return None,
    };
    amount.checked_mul(factor)
}

/// Parse a wall-clock duration into seconds, using SLURM's accepted forms.
pub fn parse_walltime_secs(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let number = |s: &str| -> Option<u64> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    };

    let (days, rest) = match value.split_once('-') {
        Some((d, rest)) => (Some(number(d)?), rest),
        None => (None, value),
    };
    let parts: Vec<u64> = rest.split(':').map(number).collect::<Option<_>>()?;

    let (d, h, m, s) = match (days, parts.as_slice()) {
        (None, [m]) => (0, 0, *m, 0),
        (None, [m, s]) => (0, 0, *m, *s),
        (None, [h, m, s]) => (0, *h, *m, *s),
        (Some(d), [h]) => (d, *h, 0, 0),
        (Some(d), [h, m]) => (d, *h, *m, 0),
        (Some(d), [h, m, s]) => (d, *h, *m, *s),
        _ => return None,
    };
    d.checked_mul(86400)?
        .checked_add(h.checked_mul(3600)?)?
        .checked_add(m.checked_mul(60)?)?
        .checked_add(s)
}

/// Render a validated walltime as `HH:MM:SS` (hours may exceed 24).
pub fn walltime_to_hms(value: &str) -> String {
    match parse_walltime_secs(value) {
        Some(secs) => format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60),
        None => value.to_string(),
    }
}

/// How a flag and its value are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagSyntax {
    /// `--flag=value`, a single token.
    Long,
    /// `-flag value`, the flag followed by the value's whitespace-separated words.
    Short,
}

/// Converts a validated value to the backend's spelling.
pub type Converter = Box<dyn Fn(&str) -> String + Send + Sync>;

/// One attribute-to-flag binding of a backend.
pub struct SchedulerArg {
    attr: Attr,
    prefix: &'static str,
    flag: &'static str,
    syntax: FlagSyntax,
    converter: Option<Converter>,
    validator: Option<fn(&str) -> bool>,
    default: Option<&'static str>,
    doc: &'static str,
    env_var: Option<&'static str>,
}

impl SchedulerArg {
    /// A `--flag=value` descriptor whose directives start with `prefix`.
    pub fn long(attr: Attr, prefix: &'static str, flag: &'static str, doc: &'static str) -> Self {
        Self::new(attr, prefix, flag, FlagSyntax::Long, doc)
    }

    /// A `-flag value` descriptor whose directives start with `prefix`.
    pub fn short(attr: Attr, prefix: &'static str, flag: &'static str, doc: &'static str) -> Self {
        Self::new(attr, prefix, flag, FlagSyntax::Short, doc)
    }

    fn new(
        attr: Attr,
        prefix: &'static str,
        flag: &'static str,
        syntax: FlagSyntax,
        doc: &'static str,
    ) -> Self {
        Self {
            attr,
            prefix,
            flag,
            syntax,
            converter: None,
            validator: None,
            default: None,
            doc,
            env_var: None,
        }
    }

    /// Convert values before rendering (defaults to the identity).
    pub fn with_converter(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.converter = Some(Box::new(f));
        self
    }

    /// Add a backend-specific check on top of the attribute's value kind.
    pub fn with_validator(mut self, f: fn(&str) -> bool) -> Self {
        self.validator = Some(f);
        self
    }

    /// Directive value to emit when the job leaves the attribute unset.
    pub fn with_default(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self
    }

    /// Environment variable consulted when the job leaves the attribute unset.
    pub fn with_env_var(mut self, name: &'static str) -> Self {
        self.env_var = Some(name);
        self
    }

    pub fn attr(&self) -> Attr {
        self.attr
    }

    pub fn flag(&self) -> &'static str {
        self.flag
    }

    pub fn doc(&self) -> &'static str {
        self.doc
    }

    pub fn env_var(&self) -> Option<&'static str> {
        self.env_var
    }

    pub fn default_value(&self) -> Option<&'static str> {
        self.default
    }

    /// Validate a value against the attribute kind and this backend's rules.
    pub fn validate(&self, value: &str) -> SchedResult<()> {
        self.attr.validate(value)?;
        match self.validator {
            Some(check) if !check(value) => Err(SchedError::validation(
                self.attr.key(),
                format!("'{value}' is not accepted by {}", self.flag),
            )),
            _ => Ok(()),
        }
    }

    /// The explicit value, or the environment override when one is set.
    fn resolve(&self, value: Option<&str>) -> Option<String> {
        match value {
            Some(v) => Some(v.to_string()),
            None => self
                .env_var
                .and_then(|name| std::env::var(name).ok())
                .filter(|v| !v.trim().is_empty()),
        }
    }

    fn convert(&self, value: &str) -> String {
        match &self.converter {
            Some(f) => f(value),
            None => value.to_string(),
        }
    }

    /// Command-line tokens for this value; empty when absent.
    pub fn to_args(&self, value: Option<&str>) -> Vec<String> {
        let Some(value) = self.resolve(value) else {
            return Vec::new();
        };
        let value = self.convert(&value);
        match self.syntax {
            FlagSyntax::Long => vec![format!("{}={}", self.flag, value)],
            FlagSyntax::Short => std::iter::once(self.flag.to_string())
                .chain(value.split_whitespace().map(str::to_string))
                .collect(),
        }
    }

    /// In-script directive for this value, or the default line when absent.
    pub fn to_directive(&self, value: Option<&str>) -> Option<String> {
        let value = match self.resolve(value) {
            Some(v) => self.convert(&v),
            None => self.default?.to_string(),
        };
        Some(match self.syntax {
            FlagSyntax::Long => format!("{} {}={}", self.prefix, self.flag, value),
            FlagSyntax::Short => format!("{} {} {}", self.prefix, self.flag, value),
        })
    }
}

impl fmt::Debug for SchedulerArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerArg")
            .field("attr", &self.attr)
            .field("flag", &self.flag)
            .field("syntax", &self.syntax)
            .field("default", &self.default)
            .field("env_var", &self.env_var)
            .finish_non_exhaustive()
    }
}

/// The attribute table of one backend.
#[derive(Debug)]
pub struct ArgTable {
    backend: &'static str,
    args: Vec<SchedulerArg>,
}

impl ArgTable {
    pub fn new(backend: &'static str, args: Vec<SchedulerArg>) -> Self {
        Self { backend, args }
    }

    /// The descriptor bound to `attr`, if this backend supports it.
    pub fn get(&self, attr: Attr) -> Option<&SchedulerArg> {
        self.args.iter().find(|a| a.attr == attr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchedulerArg> {
        self.args.iter()
    }

    /// Attribute directives for `job`, in [`Attr::ORDER`].
    ///
    /// Values are checked against this backend's rules first. An attribute
    /// the job sets but this backend cannot express is an error.
    pub fn directives(&self, job: &Job) -> SchedResult<Vec<String>> {
        let mut lines = Vec::new();
        for attr in Attr::ORDER {
            let value = job.attr_value(attr);
            match self.get(attr) {
                Some(arg) => {
                    if let Some(value) = value.as_deref() {
                        arg.validate(value)?;
                    }
                    lines.extend(arg.to_directive(value.as_deref()));
                }
                None if value.is_some() => {
                    return Err(SchedError::unsupported(
                        self.backend,
                        format!("the '{attr}' attribute"),
                    ));
                }
                None => {}
            }
        }
        Ok(lines)
    }

    /// Attribute command-line arguments for `job`, in [`Attr::ORDER`].
    pub fn args(&self, job: &Job) -> SchedResult<Vec<String>> {
        let mut tokens = Vec::new();
        for attr in Attr::ORDER {
            let value = job.attr_value(attr);
            match self.get(attr) {
                Some(arg) => {
                    if let Some(value) = value.as_deref() {
                        arg.validate(value)?;
                    }
                    tokens.extend(arg.to_args(value.as_deref()));
                }
                None if value.is_some() => {
                    return Err(SchedError::unsupported(
                        self.backend,
                        format!("the '{attr}' attribute"),
                    ));
                }
                None => {}
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    #[test]
    fn test_memory_parsing() {
        assert_eq!(parse_memory_mb("16G"), Some(16 * 1024));
        assert_eq!(parse_memory_mb("4096M"), Some(4096));
        assert_eq!(parse_memory_mb("4gb"), Some(4096));
        assert_eq!(parse_memory_mb("2GiB"), Some(2048));
        assert_eq!(parse_memory_mb("512"), Some(512));
        assert_eq!(parse_memory_mb("2048K"), Some(2));
        assert_eq!(parse_memory_mb("lots"), None);
        assert_eq!(parse_memory_mb("16X"), None);
        assert_eq!(parse_memory_mb("1.5G"), None);
    }

    #[test]
    fn test_walltime_parsing() {
        assert_eq!(parse_walltime_secs("30"), Some(1800));
        assert_eq!(parse_walltime_secs("10:30"), Some(630));
        assert_eq!(parse_walltime_secs("01:30:00"), Some(5400));
        assert_eq!(parse_walltime_secs("2-12"), Some(2 * 86400 + 12 * 3600));
        assert_eq!(parse_walltime_secs("1-00:00:01"), Some(86401));
        assert_eq!(parse_walltime_secs("1:2:3:4"), None);
        assert_eq!(parse_walltime_secs("ab:00"), None);
        assert_eq!(parse_walltime_secs(""), None);
        assert_eq!(parse_walltime_secs("999999999999999-00"), None);
        assert_eq!(parse_walltime_secs("18446744073709551615:00"), None);
        assert!(Job::new("x").unwrap().with_time("999999999999999-00").is_err());
        assert_eq!(walltime_to_hms("1-02:03:04"), "26:03:04");
        assert_eq!(walltime_to_hms("90"), "01:30:00");
    }

    #[test]
    fn test_value_kind_validation() {
        assert!(Attr::Cpu.validate("8").is_ok());
        assert!(Attr::Cpu.validate("0").is_err());
        assert!(Attr::Cpu.validate("-2").is_err());
        assert!(Attr::Mem.validate("16G").is_ok());
        assert!(Attr::Mem.validate("sixteen").is_err());
        assert!(Attr::Time.validate("04:00:00").is_ok());
        assert!(Attr::Queue.validate("gpu queue").is_err());
        assert!(Attr::Stdout.validate("logs/%x.%j.out").is_ok());
        assert!(Attr::Stdout.validate("a\nb").is_err());

        let err = Attr::Mem.validate("lots").unwrap_err();
        assert!(matches!(err, SchedError::Validation { ref field, .. } if field == "mem"));
    }

    #[test]
    fn test_long_descriptor() {
        let arg = SchedulerArg::long(Attr::Mem, "#SBATCH", "--mem", "Memory per node");
        assert_eq!(arg.to_args(Some("16G")), vec!["--mem=16G"]);
        assert!(arg.to_args(None).is_empty());
        assert_eq!(
            arg.to_directive(Some("16G")),
            Some("#SBATCH --mem=16G".to_string())
        );
        assert_eq!(arg.to_directive(None), None);
    }

    #[test]
    fn test_short_descriptor_with_converter() {
        let arg = SchedulerArg::short(Attr::Cpu, "#$", "-pe", "Parallel environment slots")
            .with_converter(|v| format!("smp {v}"));
        assert_eq!(arg.to_args(Some("8")), vec!["-pe", "smp", "8"]);
        assert_eq!(arg.to_directive(Some("8")), Some("#$ -pe smp 8".to_string()));
    }

    #[test]
    fn test_default_when_absent() {
        let arg = SchedulerArg::long(Attr::Stdout, "#SBATCH", "--output", "Stdout path")
            .with_default("%x.%j.out");
        assert_eq!(
            arg.to_directive(None),
            Some("#SBATCH --output=%x.%j.out".to_string())
        );
        assert_eq!(
            arg.to_directive(Some("run.log")),
            Some("#SBATCH --output=run.log".to_string())
        );
        // The default only applies to directives; the command line stays empty.
        assert!(arg.to_args(None).is_empty());
    }

    #[test]
    fn test_backend_validator() {
        let arg = SchedulerArg::long(Attr::Queue, "#SBATCH", "--partition", "Partition")
            .with_validator(|v| v != "forbidden");
        assert!(arg.validate("compute").is_ok());
        assert!(arg.validate("forbidden").is_err());
        assert!(arg.validate("has space").is_err());
    }
}
