//! Job request model.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::descriptor::{Attr, ValueKind};
use crate::error::{SchedError, SchedResult};
use crate::result::JobResult;
use crate::scheduler::BackendKind;

/// Value of a generic resource request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceValue {
    Count(u64),
    Text(String),
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceValue::Count(n) => write!(f, "{n}"),
            ResourceValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ResourceValue {
    fn from(n: u64) -> Self {
        ResourceValue::Count(n)
    }
}

impl From<u32> for ResourceValue {
    fn from(n: u32) -> Self {
        ResourceValue::Count(u64::from(n))
    }
}

impl From<&str> for ResourceValue {
    fn from(s: &str) -> Self {
        ResourceValue::Text(s.to_string())
    }
}

impl From<String> for ResourceValue {
    fn from(s: String) -> Self {
        ResourceValue::Text(s)
    }
}

/// A generic capability request, e.g. `gpu=2` or a licensed feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub value: ResourceValue,
}

impl Resource {
    /// Create a resource request, validating name and value.
    pub fn new(name: impl Into<String>, value: impl Into<ResourceValue>) -> SchedResult<Self> {
        let name = name.into();
        ValueKind::Identifier.validate("resource name", &name)?;
        let value = value.into();
        if let ResourceValue::Text(text) = &value {
            ValueKind::Identifier.validate(&format!("resource '{name}'"), text)?;
        }
        Ok(Self { name, value })
    }
}

/// Ordered set of resource requests. Insertion order is emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
    items: Vec<Resource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request. Re-adding a name replaces its value in place.
    pub fn add(&mut self, resource: Resource) {
        match self.items.iter_mut().find(|r| r.name == resource.name) {
            Some(existing) => existing.value = resource.value,
            None => self.items.push(resource),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.items.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// When a dependent job may start relative to its upstream jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    /// Run only if every upstream job succeeded.
    #[default]
    AfterOk,
    /// Run once every upstream job reached any terminal state.
    AfterAny,
    /// Run once every upstream job has started.
    After,
    /// Run only if at least one upstream job failed.
    AfterNotOk,
}

impl DependencyType {
    pub const ALL: [DependencyType; 4] = [
        DependencyType::AfterOk,
        DependencyType::AfterAny,
        DependencyType::After,
        DependencyType::AfterNotOk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::AfterOk => "afterok",
            DependencyType::AfterAny => "afterany",
            DependencyType::After => "after",
            DependencyType::AfterNotOk => "afternotok",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DependencyType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                SchedError::validation(
                    "dependency_type",
                    format!("expected afterok, afterany, after or afternotok, got '{s}'"),
                )
            })
    }
}

/// Raw arguments passed through verbatim to one specific backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendArgs {
    pub slurm: Vec<String>,
    pub sge: Vec<String>,
    pub pbs: Vec<String>,
    pub local: Vec<String>,
}

impl BackendArgs {
    /// The passthrough list of the given backend.
    pub fn for_backend(&self, kind: BackendKind) -> &[String] {
        match kind {
            BackendKind::Slurm => &self.slurm,
            BackendKind::Sge => &self.sge,
            BackendKind::Pbs => &self.pbs,
            BackendKind::Local => &self.local,
        }
    }

    pub fn for_backend_mut(&mut self, kind: BackendKind) -> &mut Vec<String> {
        match kind {
            BackendKind::Slurm => &mut self.slurm,
            BackendKind::Sge => &mut self.sge,
            BackendKind::Pbs => &mut self.pbs,
            BackendKind::Local => &mut self.local,
        }
    }
}

/// A job submission request.
///
/// Attribute setters validate eagerly, so an invalid value fails where it is
/// assigned. Submission takes a snapshot of the job; later changes to the
/// caller's copy do not affect a submitted job.
#[derive(Debug, Clone)]
pub struct Job {
    command: String,
    name: String,
    cpu: Option<u32>,
    mem: Option<String>,
    time: Option<String>,
    queue: Option<String>,
    nodes: Option<u32>,
    tasks: Option<u32>,
    resources: ResourceSet,
    modules: Vec<String>,
    modules_path: Vec<String>,
    inherit_env: bool,
    workdir: Option<PathBuf>,
    stdout: Option<String>,
    stderr: Option<String>,
    raw_args: Vec<String>,
    backend_args: BackendArgs,
    dependencies: Vec<JobResult>,
    dependency_type: DependencyType,
}

impl Job {
    /// Create a job for a shell command line.
    ///
    /// The name defaults to `<user>_<program>`.
    pub fn new(command: impl Into<String>) -> SchedResult<Self> {
        let command = command.into().trim().to_string();
        if command.is_empty() {
            return Err(SchedError::validation("command", "command must not be empty"));
        }
        let name = default_job_name(&command);
        Ok(Self {
            command,
            name,
            cpu: None,
            mem: None,
            time: None,
            queue: None,
            nodes: None,
            tasks: None,
            resources: ResourceSet::new(),
            modules: Vec::new(),
            modules_path: Vec::new(),
            inherit_env: true,
            workdir: None,
            stdout: None,
            stderr: None,
            raw_args: Vec::new(),
            backend_args: BackendArgs::default(),
            dependencies: Vec::new(),
            dependency_type: DependencyType::default(),
        })
    }

    /// Create a job from an argument vector, joined with single spaces.
    pub fn from_argv<I, S>(argv: I) -> SchedResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = argv.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self::new(parts.join(" "))
    }

    // ---- setters -------------------------------------------------------

    pub fn set_name(&mut self, name: impl Into<String>) -> SchedResult<()> {
        let name = name.into();
        Attr::Name.validate(&name)?;
        self.name = name;
        Ok(())
    }

    pub fn set_cpu(&mut self, cpu: u32) -> SchedResult<()> {
        Attr::Cpu.validate(&cpu.to_string())?;
        self.cpu = Some(cpu);
        Ok(())
    }

    pub fn set_mem(&mut self, mem: impl Into<String>) -> SchedResult<()> {
        let mem = mem.into();
        Attr::Mem.validate(&mem)?;
        self.mem = Some(mem);
        Ok(())
    }

    pub fn set_time(&mut self, time: impl Into<String>) -> SchedResult<()> {
        let time = time.into();
        Attr::Time.validate(&time)?;
        self.time = Some(time);
        Ok(())
    }

    pub fn set_queue(&mut self, queue: impl Into<String>) -> SchedResult<()> {
        let queue = queue.into();
        Attr::Queue.validate(&queue)?;
        self.queue = Some(queue);
        Ok(())
    }

    pub fn set_nodes(&mut self, nodes: u32) -> SchedResult<()> {
        Attr::Nodes.validate(&nodes.to_string())?;
        self.nodes = Some(nodes);
        Ok(())
    }

    pub fn set_tasks(&mut self, tasks: u32) -> SchedResult<()> {
        Attr::Tasks.validate(&tasks.to_string())?;
        self.tasks = Some(tasks);
        Ok(())
    }

    pub fn set_stdout(&mut self, path: impl Into<String>) -> SchedResult<()> {
        let path = path.into();
        Attr::Stdout.validate(&path)?;
        self.stdout = Some(path);
        Ok(())
    }

    pub fn set_stderr(&mut self, path: impl Into<String>) -> SchedResult<()> {
        let path = path.into();
        Attr::Stderr.validate(&path)?;
        self.stderr = Some(path);
        Ok(())
    }

    pub fn add_resource(&mut self, name: impl Into<String>, value: impl Into<ResourceValue>) -> SchedResult<()> {
        self.resources.add(Resource::new(name, value)?);
        Ok(())
    }

    pub fn add_module(&mut self, module: impl Into<String>) -> SchedResult<()> {
        let module = module.into();
        ValueKind::Identifier.validate("modules", &module)?;
        if !self.modules.contains(&module) {
            self.modules.push(module);
        }
        Ok(())
    }

    pub fn add_modules_path(&mut self, path: impl Into<String>) -> SchedResult<()> {
        let path = path.into();
        ValueKind::Path.validate("modules_path", &path)?;
        if !self.modules_path.contains(&path) {
            self.modules_path.push(path);
        }
        Ok(())
    }

    pub fn set_inherit_env(&mut self, inherit: bool) {
        self.inherit_env = inherit;
    }

    pub fn set_workdir(&mut self, dir: impl Into<PathBuf>) {
        self.workdir = Some(dir.into());
    }

    pub fn add_raw_arg(&mut self, arg: impl Into<String>) {
        self.raw_args.push(arg.into());
    }

    pub fn add_backend_arg(&mut self, kind: BackendKind, arg: impl Into<String>) {
        self.backend_args.for_backend_mut(kind).push(arg.into());
    }

    pub fn set_dependency_type(&mut self, dependency_type: DependencyType) {
        self.dependency_type = dependency_type;
    }

    pub fn add_dependency(&mut self, upstream: JobResult) {
        self.dependencies.push(upstream);
    }

    /// Replace the upstream list, e.g. right before pipeline submission.
    pub fn set_dependencies(&mut self, upstream: Vec<JobResult>) {
        self.dependencies = upstream;
    }

    // ---- builder -------------------------------------------------------

    pub fn with_name(mut self, name: impl Into<String>) -> SchedResult<Self> {
        self.set_name(name)?;
        Ok(self)
    }

    pub fn with_cpu(mut self, cpu: u32) -> SchedResult<Self> {
        self.set_cpu(cpu)?;
        Ok(self)
    }

    pub fn with_mem(mut self, mem: impl Into<String>) -> SchedResult<Self> {
        self.set_mem(mem)?;
        Ok(self)
    }

    pub fn with_time(mut self, time: impl Into<String>) -> SchedResult<Self> {
        self.set_time(time)?;
        Ok(self)
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> SchedResult<Self> {
        self.set_queue(queue)?;
        Ok(self)
    }

    pub fn with_nodes(mut self, nodes: u32) -> SchedResult<Self> {
        self.set_nodes(nodes)?;
        Ok(self)
    }

    pub fn with_tasks(mut self, tasks: u32) -> SchedResult<Self> {
        self.set_tasks(tasks)?;
        Ok(self)
    }

    pub fn with_stdout(mut self, path: impl Into<String>) -> SchedResult<Self> {
        self.set_stdout(path)?;
        Ok(self)
    }

    pub fn with_stderr(mut self, path: impl Into<String>) -> SchedResult<Self> {
        self.set_stderr(path)?;
        Ok(self)
    }

    pub fn with_resource(
        mut self,
        name: impl Into<String>,
        value: impl Into<ResourceValue>,
    ) -> SchedResult<Self> {
        self.add_resource(name, value)?;
        Ok(self)
    }

    pub fn with_module(mut self, module: impl Into<String>) -> SchedResult<Self> {
        self.add_module(module)?;
        Ok(self)
    }

    pub fn with_modules_path(mut self, path: impl Into<String>) -> SchedResult<Self> {
        self.add_modules_path(path)?;
        Ok(self)
    }

    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.set_inherit_env(inherit);
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.set_workdir(dir);
        self
    }

    pub fn with_raw_arg(mut self, arg: impl Into<String>) -> Self {
        self.add_raw_arg(arg);
        self
    }

    pub fn with_backend_arg(mut self, kind: BackendKind, arg: impl Into<String>) -> Self {
        self.add_backend_arg(kind, arg);
        self
    }

    pub fn with_dependency(mut self, upstream: JobResult) -> Self {
        self.add_dependency(upstream);
        self
    }

    pub fn with_dependency_type(mut self, dependency_type: DependencyType) -> Self {
        self.set_dependency_type(dependency_type);
        self
    }

    // ---- accessors -----------------------------------------------------

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu(&self) -> Option<u32> {
        self.cpu
    }

    pub fn mem(&self) -> Option<&str> {
        self.mem.as_deref()
    }

    pub fn time(&self) -> Option<&str> {
        self.time.as_deref()
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn nodes(&self) -> Option<u32> {
        self.nodes
    }

    pub fn tasks(&self) -> Option<u32> {
        self.tasks
    }

    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn modules_path(&self) -> &[String] {
        &self.modules_path
    }

    pub fn inherit_env(&self) -> bool {
        self.inherit_env
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    pub fn raw_args(&self) -> &[String] {
        &self.raw_args
    }

    pub fn backend_args(&self) -> &BackendArgs {
        &self.backend_args
    }

    pub fn dependencies(&self) -> &[JobResult] {
        &self.dependencies
    }

    pub fn dependency_type(&self) -> DependencyType {
        self.dependency_type
    }

    /// Basename of the command's program, e.g. `python` for `/usr/bin/python x.py`.
    pub fn tool_name(&self) -> &str {
        tool_name(&self.command)
    }

    /// Rendered value of a descriptor-mapped attribute.
    pub fn attr_value(&self, attr: Attr) -> Option<String> {
        match attr {
            Attr::Cpu => self.cpu.map(|n| n.to_string()),
            Attr::Mem => self.mem.clone(),
            Attr::Time => self.time.clone(),
            Attr::Queue => self.queue.clone(),
            Attr::Nodes => self.nodes.map(|n| n.to_string()),
            Attr::Tasks => self.tasks.map(|n| n.to_string()),
            Attr::Name => Some(self.name.clone()),
            Attr::Stdout => self.stdout.clone(),
            Attr::Stderr => self.stderr.clone(),
        }
    }
}

fn tool_name(command: &str) -> &str {
    let program = command.split_whitespace().next().unwrap_or(command);
    program.rsplit('/').next().unwrap_or(program)
}

/// `<user>_<program>`, restricted to characters every scheduler accepts.
fn default_job_name(command: &str) -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let raw = format!("{user}_{}", tool_name(command));
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
