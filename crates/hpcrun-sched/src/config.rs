//! Layered job configuration.
//!
//! An [`HpcConfig`] holds job field overrides at three levels: `defaults`,
//! per-tool (`tools.<program>`) and per-type (`types.<name>`). Lookups merge
//! the matching level over the defaults with [`deep_merge`].

use std::path::PathBuf;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SchedError, SchedResult};
use crate::job::{DependencyType, Job};
use crate::scheduler::{BackendKind, SchedulerConfig};

/// First element of an override sequence that replaces the base sequence
/// instead of extending it.
pub const RESET_MARKER: &str = "-";

/// Job field overrides, keyed by field name.
pub type JobOverrides = Map<String, Value>;

/// Parsed configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HpcConfig {
    /// Scheduler name, or `auto`.
    pub scheduler: Option<String>,
    /// Overrides applied to every job.
    pub defaults: JobOverrides,
    /// Overrides keyed by the program a job runs.
    pub tools: FxHashMap<String, JobOverrides>,
    /// Overrides keyed by an explicit job type.
    pub types: FxHashMap<String, JobOverrides>,
    /// Backend settings.
    pub schedulers: SchedulerConfig,
}

impl HpcConfig {
    /// Overrides for a job type or tool name.
    ///
    /// An exact type match wins over a tool match; with neither, the
    /// defaults are returned as they are.
    pub fn get_job_config(&self, name: &str) -> JobOverrides {
        let specific = self.types.get(name).or_else(|| self.tools.get(name));
        match specific {
            Some(overrides) => merge_maps(&self.defaults, overrides),
            None => self.defaults.clone(),
        }
    }

    /// Build a job for `command` from the overrides matching `job_type`, or
    /// the command's program when no type is given.
    pub fn job(&self, command: &str, job_type: Option<&str>) -> SchedResult<Job> {
        let mut job = Job::new(command)?;
        let key = job_type.map_or_else(|| job.tool_name().to_string(), str::to_string);
        job.apply_config(&self.get_job_config(&key))?;
        Ok(job)
    }
}

/// Merge `overlay` over `base`.
///
/// Mappings merge key by key, recursively. Sequences merge as a union: the
/// base items in order, then overlay items not already present. An overlay
/// sequence whose first element is [`RESET_MARKER`] replaces the base with
/// its remaining items. Anything else in `overlay` replaces `base`.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => Value::Object(merge_maps(b, o)),
        (_, Value::Array(items)) if is_reset(items) => Value::Array(items[1..].to_vec()),
        (Value::Array(b), Value::Array(o)) => {
            let mut merged = b.clone();
            for item in o {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Value::Array(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

fn merge_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        let next = match merged.get(key) {
            Some(existing) => deep_merge(existing, value),
            None => strip_reset(value),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

fn is_reset(items: &[Value]) -> bool {
    items.first().and_then(Value::as_str) == Some(RESET_MARKER)
}

/// A value with nothing underneath still loses its reset marker.
fn strip_reset(value: &Value) -> Value {
    match value {
        Value::Array(items) if is_reset(items) => Value::Array(items[1..].to_vec()),
        Value::Object(map) => Value::Object(merge_maps(&Map::new(), map)),
        other => other.clone(),
    }
}

impl Job {
    /// Create a job and apply configuration overrides to it.
    pub fn from_config(command: impl Into<String>, overrides: &JobOverrides) -> SchedResult<Self> {
        let mut job = Job::new(command)?;
        job.apply_config(overrides)?;
        Ok(job)
    }

    /// Apply configuration overrides through the validating setters.
    ///
    /// `null` values are skipped. Unknown keys are rejected.
    pub fn apply_config(&mut self, overrides: &JobOverrides) -> SchedResult<()> {
        for (key, value) in overrides {
            if value.is_null() {
                continue;
            }
            match key.as_str() {
                "name" => self.set_name(text(key, value)?)?,
                "cpu" => self.set_cpu(count(key, value)?)?,
                "mem" => self.set_mem(text(key, value)?)?,
                "time" => self.set_time(text(key, value)?)?,
                "queue" => self.set_queue(text(key, value)?)?,
                "nodes" => self.set_nodes(count(key, value)?)?,
                "tasks" => self.set_tasks(count(key, value)?)?,
                "stdout" => self.set_stdout(text(key, value)?)?,
                "stderr" => self.set_stderr(text(key, value)?)?,
                "workdir" => self.set_workdir(PathBuf::from(text(key, value)?)),
                "inherit_env" => {
                    let inherit = value
                        .as_bool()
                        .ok_or_else(|| SchedError::validation(key, "expected true or false"))?;
                    self.set_inherit_env(inherit);
                }
                "modules" => {
                    for module in list(key, value)? {
                        self.add_module(module)?;
                    }
                }
                "modules_path" => {
                    for path in list(key, value)? {
                        self.add_modules_path(path)?;
                    }
                }
                "raw_args" => {
                    for arg in list(key, value)? {
                        self.add_raw_arg(arg);
                    }
                }
                "slurm_args" | "sge_args" | "pbs_args" | "local_args" => {
                    let backend = key.trim_end_matches("_args").parse::<BackendKind>()?;
                    for arg in list(key, value)? {
                        self.add_backend_arg(backend, arg);
                    }
                }
                "resources" => {
                    let resources = value.as_object().ok_or_else(|| {
                        SchedError::validation(key, "expected a mapping of resource names to values")
                    })?;
                    for (name, amount) in resources {
                        match amount {
                            Value::Number(n) => {
                                let n = n.as_u64().ok_or_else(|| {
                                    SchedError::validation(
                                        format!("resource '{name}'"),
                                        "expected a non-negative integer",
                                    )
                                })?;
                                self.add_resource(name.as_str(), n)?;
                            }
                            other => self.add_resource(name.as_str(), text(name, other)?)?,
                        }
                    }
                }
                "dependency_type" => {
                    self.set_dependency_type(text(key, value)?.parse::<DependencyType>()?)
                }
                _ => return Err(SchedError::validation(key, "unknown job option")),
            }
        }
        Ok(())
    }
}

/// A string, or a number or boolean written without quotes.
fn text(key: &str, value: &Value) -> SchedResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(SchedError::validation(key, "expected a scalar value")),
    }
}

fn count(key: &str, value: &Value) -> SchedResult<u32> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| SchedError::validation(key, format!("expected a positive integer, got {value}")))
}

/// A sequence of scalars; a single scalar counts as a one-element sequence.
fn list(key: &str, value: &Value) -> SchedResult<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter(|item| item.as_str() != Some(RESET_MARKER))
            .map(|item| text(key, item))
            .collect(),
        scalar => Ok(vec![text(key, scalar)?]),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn overrides(value: Value) -> JobOverrides {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn config() -> HpcConfig {
        serde_json::from_value(json!({
            "scheduler": "slurm",
            "defaults": { "cpu": 1, "mem": "4G", "modules": ["gcc/12"] },
            "tools": {
                "python": { "mem": "8G", "modules": ["python/3.11"] },
                "gatk": { "cpu": 4 }
            },
            "types": {
                "python": { "cpu": 16, "modules": ["-", "conda"] }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_type_match_beats_tool_match() {
        let config = config();
        let merged = config.get_job_config("python");
        assert_eq!(merged["cpu"], json!(16));
        assert_eq!(merged["mem"], json!("4G"));
        assert_eq!(merged["modules"], json!(["conda"]));

        let merged = config.get_job_config("gatk");
        assert_eq!(merged["cpu"], json!(4));
        assert_eq!(merged["modules"], json!(["gcc/12"]));

        assert_eq!(config.get_job_config("unknown"), config.defaults);
    }

    #[test]
    fn test_sequences_union_in_base_order() {
        let merged = deep_merge(&json!(["a", "b"]), &json!(["b", "c"]));
        assert_eq!(merged, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_nested_mappings_merge() {
        let merged = deep_merge(
            &json!({ "resources": { "gpu": 1, "license": "matlab" } }),
            &json!({ "resources": { "gpu": 2 }, "queue": "long" }),
        );
        assert_eq!(
            merged,
            json!({ "resources": { "gpu": 2, "license": "matlab" }, "queue": "long" })
        );
    }

    #[test]
    fn test_reset_marker_without_base() {
        let merged = deep_merge(&json!({}), &json!({ "modules": ["-", "a"] }));
        assert_eq!(merged, json!({ "modules": ["a"] }));
    }

    #[test]
    fn test_job_from_config() {
        let job = Job::from_config(
            "python train.py",
            &overrides(json!({
                "name": "train",
                "cpu": "8",
                "mem": "16G",
                "time": "2:00:00",
                "modules": ["python/3.11", "cuda"],
                "inherit_env": false,
                "slurm_args": ["--exclusive"],
                "resources": { "gpu": 2 },
                "dependency_type": "afterany",
                "stdout": null
            })),
        )
        .unwrap();

        assert_eq!(job.name(), "train");
        assert_eq!(job.cpu(), Some(8));
        assert_eq!(job.mem(), Some("16G"));
        assert_eq!(job.time(), Some("2:00:00"));
        assert_eq!(job.modules(), ["python/3.11", "cuda"]);
        assert!(!job.inherit_env());
        assert_eq!(job.backend_args().slurm, ["--exclusive"]);
        assert_eq!(job.resources().get("gpu").unwrap().value.to_string(), "2");
        assert_eq!(job.dependency_type(), DependencyType::AfterAny);
        assert_eq!(job.stdout(), None);
    }

    #[test]
    fn test_invalid_overrides_fail() {
        let bad_cpu = Job::from_config("true", &overrides(json!({ "cpu": "many" })));
        assert!(matches!(bad_cpu, Err(SchedError::Validation { .. })));

        let unknown = Job::from_config("true", &overrides(json!({ "colour": "blue" })));
        assert!(matches!(unknown, Err(SchedError::Validation { ref field, .. }) if field == "colour"));
    }

    #[test]
    fn test_config_job_uses_tool_name() {
        let job = config().job("gatk HaplotypeCaller", None).unwrap();
        assert_eq!(job.cpu(), Some(4));
        let job = config().job("gatk HaplotypeCaller", Some("python")).unwrap();
        assert_eq!(job.cpu(), Some(16));
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-z]{1,6}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ]
    }

    fn words() -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec("[a-z]{1,4}".prop_map(Value::from), 0..6)
    }

    proptest! {
        #[test]
        fn prop_scalar_override_wins(base in scalar(), overlay in scalar()) {
            let merged = deep_merge(&json!({ "k": base, "other": 1 }), &json!({ "k": overlay.clone() }));
            prop_assert_eq!(&merged["k"], &overlay);
            prop_assert_eq!(&merged["other"], &json!(1));
        }

        #[test]
        fn prop_reset_yields_remainder(base in words(), rest in words()) {
            let mut overlay = vec![Value::from(RESET_MARKER)];
            overlay.extend(rest.clone());
            let merged = deep_merge(&Value::Array(base), &Value::Array(overlay));
            prop_assert_eq!(merged, Value::Array(rest));
        }

        #[test]
        fn prop_union_keeps_base_prefix(base in words(), overlay in words()) {
            prop_assume!(overlay.first().and_then(Value::as_str) != Some(RESET_MARKER));
            let merged = deep_merge(&Value::Array(base.clone()), &Value::Array(overlay.clone()));
            let merged = merged.as_array().unwrap();
            prop_assert_eq!(&merged[..base.len()], &base[..]);
            for item in &overlay {
                prop_assert!(merged.contains(item));
            }
        }

        #[test]
        fn prop_independent_keys_commute(a in scalar(), b in scalar()) {
            let left = deep_merge(&json!({ "x": a.clone() }), &json!({ "y": b.clone() }));
            let right = deep_merge(&json!({ "y": b }), &json!({ "x": a }));
            prop_assert_eq!(left, right);
        }
    }
}
