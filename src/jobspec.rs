//! Jobspec v1: the structured job-request document (spec §3, §4.3).
//!
//! Grounded on `original_source/src/common/libjob/jobspec1.c`: the same
//! field names, the same structural checks (`tasks_check`,
//! `slot_vertex_check`, `node_vertex_check`, `resources_check`,
//! `attr_system_check`), and the same `from_command` convenience
//! constructor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FluxError, FluxResult};

/// A decoded jobspec, kept as a `serde_json::Value` tree (like the original
/// implementation's `json_t *`) so mutation helpers can operate on
/// arbitrary dotted attribute paths without a rigid struct shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Jobspec(pub Value);

impl Jobspec {
    pub fn from_value(v: Value) -> Self {
        Jobspec(v)
    }

    pub fn decode(s: &str) -> FluxResult<Self> {
        let v: Value = serde_json::from_str(s)
            .map_err(|e| FluxError::invalid(format!("jobspec decode: {e}")))?;
        Ok(Jobspec(v))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(&self.0).expect("jobspec value always serializes")
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn attr_path(name: &str) -> String {
        format!("attributes.{name}")
    }

    /// `attr_unpack`: read a JSON value at `attributes.<path>`.
    pub fn attr_get(&self, path: &str) -> Option<&Value> {
        jpath_get(&self.0, &Self::attr_path(path))
    }

    /// `attr_set`: write a JSON value at `attributes.<path>`, creating
    /// intermediate objects as needed.
    pub fn attr_set(&mut self, path: &str, value: Value) -> FluxResult<()> {
        jpath_set(&mut self.0, &Self::attr_path(path), value)
    }

    /// `attr_del`: remove the value at `attributes.<path>`.
    pub fn attr_del(&mut self, path: &str) -> FluxResult<()> {
        jpath_del(&mut self.0, &Self::attr_path(path))
    }

    pub fn setenv(&mut self, name: &str, value: &str, overwrite: bool) -> FluxResult<()> {
        let path = format!("system.environment.{name}");
        if !overwrite && self.attr_get(&path).is_some() {
            return Ok(());
        }
        self.attr_set(&path, Value::String(value.to_string()))
    }

    pub fn unsetenv(&mut self, name: &str) -> FluxResult<()> {
        self.attr_del(&format!("system.environment.{name}"))
    }

    fn set_stdio(&mut self, stdio_name: &str, path: &str) -> FluxResult<()> {
        let key = format!("system.shell.options.{stdio_name}");
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::String("file".to_string()));
        obj.insert("path".to_string(), Value::String(path.to_string()));
        self.attr_set(&key, Value::Object(obj))
    }

    pub fn set_stdin(&mut self, path: &str) -> FluxResult<()> {
        self.set_stdio("input.stdin", path)
    }

    pub fn set_stdout(&mut self, path: &str) -> FluxResult<()> {
        self.set_stdio("output.stdout", path)
    }

    pub fn set_stderr(&mut self, path: &str) -> FluxResult<()> {
        self.set_stdio("output.stderr", path)
    }

    pub fn set_cwd(&mut self, cwd: &str) -> FluxResult<()> {
        self.attr_set("system.cwd", Value::String(cwd.to_string()))
    }

    /// `queue`, if set.
    pub fn queue(&self) -> Option<&str> {
        self.0
            .pointer("/attributes/system/queue")
            .and_then(Value::as_str)
    }

    /// `attributes.system.duration`, defaulting to 0 (unlimited/unset) if absent.
    pub fn duration(&self) -> f64 {
        self.0
            .pointer("/attributes/system/duration")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    /// Total node/core/gpu counts, mirroring `jj_get_counts` in the original
    /// implementation: walk the single root vertex, descending into its
    /// `with` children.
    pub fn resource_counts(&self) -> FluxResult<ResourceCounts> {
        let resources = self
            .0
            .get("resources")
            .and_then(Value::as_array)
            .ok_or_else(|| FluxError::invalid("resources section missing"))?;
        let root = resources
            .first()
            .ok_or_else(|| FluxError::invalid("resources section is empty"))?;
        count_vertex(root)
    }

    /// Validate against the full jobspec v1 rule set (spec §4.3). Returns
    /// `Err("<where>: <reason>")`-shaped messages via `FluxError::InvalidArgument`.
    pub fn validate(&self) -> FluxResult<()> {
        let obj = self
            .0
            .as_object()
            .ok_or_else(|| FluxError::invalid("jobspec object: not an object"))?;

        let version = obj
            .get("version")
            .and_then(Value::as_i64)
            .ok_or_else(|| FluxError::invalid("jobspec object: version missing or not integer"))?;
        if version != 1 {
            return Err(FluxError::invalid("only version 1 jobspec is supported"));
        }

        let resources = obj
            .get("resources")
            .ok_or_else(|| FluxError::invalid("jobspec object: resources missing"))?;
        let tasks = obj
            .get("tasks")
            .ok_or_else(|| FluxError::invalid("jobspec object: tasks missing"))?;
        let attributes = obj
            .get("attributes")
            .ok_or_else(|| FluxError::invalid("jobspec object: attributes missing"))?;

        check_resources(resources)?;
        check_tasks(tasks)?;
        check_attributes(attributes)?;
        Ok(())
    }

    /// `flux_jobspec1_from_command` equivalent: build a minimal valid
    /// jobspec from a bare command line (SPEC_FULL §4.3.1).
    pub fn from_command(
        argv: &[String],
        env: &[(String, String)],
        ntasks: i64,
        cores_per_task: i64,
        gpus_per_task: i64,
        nnodes: i64,
        duration: f64,
    ) -> FluxResult<Self> {
        if argv.is_empty() || duration < 0.0 {
            return Err(FluxError::invalid(
                "argv must be nonempty and duration must be >= 0",
            ));
        }
        let ntasks = if ntasks < 1 { 1 } else { ntasks };
        let cores_per_task = if cores_per_task < 1 { 1 } else { cores_per_task };
        if nnodes > ntasks {
            return Err(FluxError::invalid("nnodes must not exceed ntasks"));
        }

        let mut with: Vec<Value> = vec![serde_json::json!({"type": "core", "count": cores_per_task})];
        if gpus_per_task > 0 {
            with.push(serde_json::json!({"type": "gpu", "count": gpus_per_task}));
        }
        let slot = serde_json::json!({
            "type": "slot",
            "count": ntasks,
            "with": with,
            "label": "task",
        });
        let resources = if nnodes > 0 {
            vec![serde_json::json!({
                "type": "node",
                "count": nnodes,
                "with": [slot],
            })]
        } else {
            vec![slot]
        };

        let tasks = vec![serde_json::json!({
            "command": argv,
            "slot": "task",
            "count": {"per_slot": 1},
        })];

        let mut jobspec = Jobspec(serde_json::json!({
            "resources": resources,
            "tasks": tasks,
            "attributes": {
                "system": {
                    "duration": duration,
                    "environment": {},
                }
            },
            "version": 1,
        }));

        for (k, v) in env {
            jobspec.setenv(k, v, true)?;
        }
        Ok(jobspec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounts {
    pub nnodes: i64,
    pub nslots: i64,
    pub ncores: i64,
    pub ngpus: i64,
}

fn count_vertex(vertex: &Value) -> FluxResult<ResourceCounts> {
    let vtype = vertex
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| FluxError::invalid("resource vertex: type missing"))?;
    let count = vertex
        .get("count")
        .and_then(Value::as_i64)
        .ok_or_else(|| FluxError::invalid("resource vertex: count missing"))?;

    match vtype {
        "node" => {
            let with = vertex
                .get("with")
                .and_then(Value::as_array)
                .ok_or_else(|| FluxError::invalid("node vertex: with missing"))?;
            let slot = with
                .first()
                .ok_or_else(|| FluxError::invalid("node vertex: with is empty"))?;
            let slot_counts = count_vertex(slot)?;
            Ok(ResourceCounts {
                nnodes: count,
                nslots: count * slot_counts.nslots,
                ncores: count * slot_counts.ncores,
                ngpus: count * slot_counts.ngpus,
            })
        }
        "slot" => {
            let with = vertex
                .get("with")
                .and_then(Value::as_array)
                .ok_or_else(|| FluxError::invalid("slot vertex: with missing"))?;
            let mut cores = 0i64;
            let mut gpus = 0i64;
            for child in with {
                let ctype = child.get("type").and_then(Value::as_str).unwrap_or("");
                let c = child.get("count").and_then(Value::as_i64).unwrap_or(0);
                match ctype {
                    "core" => cores += c,
                    "gpu" => gpus += c,
                    _ => {}
                }
            }
            Ok(ResourceCounts {
                nnodes: 0,
                nslots: count,
                ncores: count * cores,
                ngpus: count * gpus,
            })
        }
        other => Err(FluxError::invalid(format!("unknown resource vertex type {other}"))),
    }
}

fn check_tasks(tasks: &Value) -> FluxResult<()> {
    let arr = tasks
        .as_array()
        .ok_or_else(|| FluxError::invalid("tasks section: must be an array"))?;
    if arr.len() != 1 {
        return Err(FluxError::invalid("tasks section: must have exactly one element"));
    }
    let task = &arr[0];
    let command = task
        .get("command")
        .and_then(Value::as_array)
        .ok_or_else(|| FluxError::invalid("tasks command must be an array"))?;
    if command.is_empty() {
        return Err(FluxError::invalid("tasks command array length must be >= 1"));
    }
    if !command.iter().all(Value::is_string) {
        return Err(FluxError::invalid("tasks command array entry must be a string"));
    }
    if task.get("slot").and_then(Value::as_str) != Some("task") {
        return Err(FluxError::invalid("tasks slot must be \"task\""));
    }
    let count = task
        .get("count")
        .and_then(Value::as_object)
        .ok_or_else(|| FluxError::invalid("tasks count must be an object"))?;
    if count.len() != 1 {
        return Err(FluxError::invalid("tasks count must have exactly one key set"));
    }
    match (count.get("per_slot"), count.get("total")) {
        (Some(n), None) | (None, Some(n)) => {
            let n = n
                .as_i64()
                .ok_or_else(|| FluxError::invalid("tasks count value must be an integer"))?;
            if n < 1 {
                return Err(FluxError::invalid("tasks count value must be >= 1"));
            }
        }
        _ => return Err(FluxError::invalid("tasks count object is malformed")),
    }
    Ok(())
}

fn check_resources(resources: &Value) -> FluxResult<()> {
    let arr = resources
        .as_array()
        .ok_or_else(|| FluxError::invalid("resources section: must be an array"))?;
    if arr.len() != 1 {
        return Err(FluxError::invalid("resources section: must have exactly one root vertex"));
    }
    let vertex = &arr[0];
    let vtype = vertex
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| FluxError::invalid("resource vertex: type missing"))?;
    match vtype {
        "node" => check_node_vertex(vertex),
        "slot" => check_slot_vertex(vertex),
        _ => Err(FluxError::invalid("unknown resource vertex type")),
    }
}

fn check_node_vertex(node: &Value) -> FluxResult<()> {
    let count = node
        .get("count")
        .and_then(Value::as_i64)
        .ok_or_else(|| FluxError::invalid("node vertex: count missing"))?;
    if count < 1 {
        return Err(FluxError::invalid("node count must be >= 1"));
    }
    let with = node
        .get("with")
        .and_then(Value::as_array)
        .ok_or_else(|| FluxError::invalid("node with must be an array"))?;
    if with.len() != 1 {
        return Err(FluxError::invalid("node with array must have 1 element"));
    }
    check_slot_vertex(&with[0])
}

fn check_slot_vertex(slot: &Value) -> FluxResult<()> {
    let count = slot
        .get("count")
        .and_then(Value::as_i64)
        .ok_or_else(|| FluxError::invalid("slot count missing"))?;
    if count < 1 {
        return Err(FluxError::invalid("slot count must be >= 1"));
    }
    if slot.get("label").and_then(Value::as_str).is_none() {
        return Err(FluxError::invalid("slot vertex: label missing"));
    }
    let with = slot
        .get("with")
        .and_then(Value::as_array)
        .ok_or_else(|| FluxError::invalid("slot with must be an array"))?;
    if with.is_empty() || with.len() > 2 {
        return Err(FluxError::invalid("slot with array must have 1-2 elements"));
    }
    for child in with {
        let ctype = child
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FluxError::invalid("slot with: type missing"))?;
        let ccount = child
            .get("count")
            .and_then(Value::as_i64)
            .ok_or_else(|| FluxError::invalid("slot with: count missing"))?;
        let min_count = match ctype {
            "core" => 1,
            "gpu" => 0,
            _ => return Err(FluxError::invalid("slot with type must be core or gpu")),
        };
        if ccount < min_count {
            return Err(FluxError::invalid(format!(
                "slot {ctype} count must be >= {min_count}"
            )));
        }
    }
    Ok(())
}

fn check_attributes(attributes: &Value) -> FluxResult<()> {
    let obj = attributes
        .as_object()
        .ok_or_else(|| FluxError::invalid("attributes must be an object"))?;
    let mut has_system = false;
    for (key, value) in obj {
        match key.as_str() {
            "user" => {
                if value.as_object().is_none_or(Map::is_empty) {
                    return Err(FluxError::invalid(
                        "if present, attributes.user must contain values",
                    ));
                }
            }
            "system" => {
                if value.as_object().is_none_or(Map::is_empty) {
                    return Err(FluxError::invalid(
                        "if present, attributes.system must contain values",
                    ));
                }
                check_attr_system(value)?;
                has_system = true;
            }
            other => {
                return Err(FluxError::invalid(format!("unknown attributes section {other}")));
            }
        }
    }
    if !has_system {
        return Err(FluxError::invalid("attributes.system is required"));
    }
    Ok(())
}

fn check_attr_system(system: &Value) -> FluxResult<()> {
    let obj = system.as_object().expect("checked by caller");
    let mut has_duration = false;
    for (key, value) in obj {
        match key.as_str() {
            "duration" => {
                if !value.is_number() {
                    return Err(FluxError::invalid("attributes.system.duration must be a number"));
                }
                has_duration = true;
            }
            "environment" => {
                if !value.is_object() {
                    return Err(FluxError::invalid(
                        "attributes.system.environment must be a dictionary",
                    ));
                }
            }
            "constraints" => {
                if !value.is_object() {
                    return Err(FluxError::invalid(
                        "attributes.system.constraints must be a dictionary",
                    ));
                }
            }
            "dependencies" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| FluxError::invalid("attributes.system.dependencies must be an array"))?;
                for el in arr {
                    let scheme = el.get("scheme").and_then(Value::as_str);
                    let val = el.get("value").and_then(Value::as_str);
                    if scheme.is_none() || val.is_none() {
                        return Err(FluxError::invalid(
                            "attributes.system.dependencies elements must contain scheme and value strings",
                        ));
                    }
                }
            }
            "shell" => {
                if let Some(opt) = value.get("options")
                    && !opt.is_object()
                {
                    return Err(FluxError::invalid("attributes.shell.options must be a dictionary"));
                }
            }
            _ => { /* other system keys tolerated, see SPEC_FULL §4.3 */ }
        }
    }
    if !has_duration {
        return Err(FluxError::invalid("attributes.system.duration is required"));
    }
    Ok(())
}

// --- minimal jpath helpers over dotted paths, grounded on libutil/jpath.h's contract ---

fn jpath_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn jpath_set(root: &mut Value, path: &str, value: Value) -> FluxResult<()> {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let parts: Vec<&str> = path.split('.').collect();
    let mut cur = root;
    for part in &parts[..parts.len() - 1] {
        if !cur.is_object() {
            return Err(FluxError::invalid("jpath_set: path traverses a non-object"));
        }
        let map = cur.as_object_mut().expect("checked above");
        cur = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = cur
        .as_object_mut()
        .ok_or_else(|| FluxError::invalid("jpath_set: parent is not an object"))?;
    map.insert(parts[parts.len() - 1].to_string(), value);
    Ok(())
}

fn jpath_del(root: &mut Value, path: &str) -> FluxResult<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cur = root;
    for part in &parts[..parts.len() - 1] {
        match cur.get_mut(*part) {
            Some(next) => cur = next,
            None => return Ok(()),
        }
    }
    if let Some(map) = cur.as_object_mut() {
        map.remove(parts[parts.len() - 1]);
    }
    Ok(())
}

/// The subset of a job descriptor sent to out-of-process workers (spec §4.5):
/// `{jobspec, userid, rolemask, urgency, flags}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub jobspec: Value,
    pub userid: u32,
    pub rolemask: u32,
    pub urgency: i32,
    pub flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_jobspec(duration: f64) -> Jobspec {
        Jobspec(serde_json::json!({
            "resources": [{"type": "slot", "count": 1, "label": "task",
                           "with": [{"type": "core", "count": 1}]}],
            "tasks": [{"command": ["hostname"], "slot": "task", "count": {"per_slot": 1}}],
            "attributes": {"system": {"duration": duration}},
            "version": 1,
        }))
    }

    #[test]
    fn minimal_jobspec_validates() {
        minimal_jobspec(60.0).validate().unwrap();
    }

    #[test]
    fn missing_duration_is_rejected() {
        let js = Jobspec(serde_json::json!({
            "resources": [{"type": "slot", "count": 1, "label": "task",
                           "with": [{"type": "core", "count": 1}]}],
            "tasks": [{"command": ["hostname"], "slot": "task", "count": {"per_slot": 1}}],
            "attributes": {"system": {}},
            "version": 1,
        }));
        assert!(js.validate().is_err());
    }

    #[test]
    fn unknown_top_level_attribute_section_rejected() {
        let mut js = minimal_jobspec(60.0);
        js.attr_set("bogus.key", Value::String("x".into())).unwrap();
        assert!(js.validate().is_err());
    }

    #[test]
    fn resource_counts_handles_node_slot_core_gpu() {
        let js = Jobspec(serde_json::json!({
            "resources": [{"type": "node", "count": 2, "with": [
                {"type": "slot", "count": 3, "label": "task", "with": [
                    {"type": "core", "count": 4}, {"type": "gpu", "count": 1}
                ]}
            ]}],
            "tasks": [{"command": ["x"], "slot": "task", "count": {"per_slot": 1}}],
            "attributes": {"system": {"duration": 0.0}},
            "version": 1,
        }));
        let counts = js.resource_counts().unwrap();
        assert_eq!(counts.nnodes, 2);
        assert_eq!(counts.nslots, 6);
        assert_eq!(counts.ncores, 24);
        assert_eq!(counts.ngpus, 2);
    }

    #[test]
    fn setenv_then_getenv_round_trips() {
        let mut js = minimal_jobspec(60.0);
        js.setenv("FOO", "bar", true).unwrap();
        assert_eq!(
            js.attr_get("system.environment.FOO").unwrap().as_str(),
            Some("bar")
        );
        js.unsetenv("FOO").unwrap();
        assert!(js.attr_get("system.environment.FOO").is_none());
    }

    #[test]
    fn from_command_builds_valid_jobspec() {
        let argv = vec!["hostname".to_string()];
        let js = Jobspec::from_command(&argv, &[], 2, 1, 0, 0, 60.0).unwrap();
        js.validate().unwrap();
        assert_eq!(js.resource_counts().unwrap().nslots, 2);
    }
}
