//! Job-manager policy plugins: `job.create` and `job.validate` hooks that
//! run over a submitted jobspec before it is announced (spec §4.4).
//!
//! Grounded on
//! `original_source/src/modules/job-manager/plugins/jobspec-default.c`,
//! `limit-duration.c`, and `limit-job-size.c`. Each plugin in the original
//! implementation is a libjob-manager `flux_plugin_t` callback; here the
//! same two call sites are represented as a small trait so policies can be
//! composed in a fixed pipeline instead of dynamically loaded.

use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{FluxError, FluxResult};
use crate::jobspec::Jobspec;

/// A decoded `[queues.<name>]` policy config section, as loaded from the
/// ingest TOML config (SPEC_FULL §0.3).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueuePolicy {
    #[serde(default)]
    pub defaults: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub duration_limit: Option<Duration>,
    #[serde(default)]
    pub size_limit: Option<SizeLimit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub general_defaults: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub general_duration_limit: Option<Duration>,
    #[serde(default)]
    pub general_size_limit: Option<SizeLimit>,
    #[serde(default)]
    pub queues: HashMap<String, QueuePolicy>,
}

/// A duration limit, in seconds. `0.0` means unlimited (spec §4.4 sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Duration(pub f64);

impl Duration {
    pub fn is_unlimited(&self) -> bool {
        self.0 == 0.0
    }
}

/// `-1` means unlimited on any individual axis (spec §4.4 sentinel),
/// matching `limit-job-size.c`'s convention.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SizeLimit {
    #[serde(default = "default_unlimited")]
    pub max_nnodes: i64,
    #[serde(default = "default_unlimited")]
    pub max_ncores: i64,
    #[serde(default = "default_unlimited")]
    pub max_ngpus: i64,
    #[serde(default = "default_unlimited")]
    pub min_nnodes: i64,
    #[serde(default = "default_unlimited")]
    pub min_ncores: i64,
    #[serde(default = "default_unlimited")]
    pub min_ngpus: i64,
}

fn default_unlimited() -> i64 {
    -1
}

/// Applied to a jobspec at `job.create`, before the jobspec is persisted;
/// emits a `jobspec-update` event describing what it changed rather than
/// mutating the jobspec silently (spec §4.4).
pub trait CreatePlugin {
    fn name(&self) -> &'static str;
    /// Returns the set of attribute paths this call defaulted in, for the
    /// `jobspec-update` event payload. Only fires when the job is in the
    /// `NEW` state (checked by the caller).
    fn apply(&self, jobspec: &mut Jobspec, queue: Option<&QueuePolicy>, cfg: &PolicyConfig)
        -> FluxResult<Vec<(String, serde_json::Value)>>;
}

/// Applied to a jobspec at `job.validate`, after defaulting; may reject the
/// job outright.
pub trait ValidatePlugin {
    fn name(&self) -> &'static str;
    fn validate(&self, jobspec: &Jobspec, queue: Option<&QueuePolicy>, cfg: &PolicyConfig) -> FluxResult<()>;
}

/// `jobspec-default`: merges general defaults with any queue-specific
/// override (queue values win wholesale per key, not merged field-by-field),
/// then applies the combined default map wherever the jobspec doesn't
/// already set a value. Duration `0` (unset) is treated the same as absent,
/// and a default duration given as an FSD string is converted to seconds
/// before it is applied. A named-but-unconfigured queue is tolerated: the
/// job proceeds using only the general defaults (SPEC_FULL §9, Open
/// Question decision #4).
pub struct JobspecDefaultPlugin;

impl CreatePlugin for JobspecDefaultPlugin {
    fn name(&self) -> &'static str {
        "jobspec-default"
    }

    fn apply(
        &self,
        jobspec: &mut Jobspec,
        queue: Option<&QueuePolicy>,
        cfg: &PolicyConfig,
    ) -> FluxResult<Vec<(String, serde_json::Value)>> {
        let mut merged = cfg.general_defaults.clone();
        if let Some(q) = queue {
            for (k, v) in &q.defaults {
                merged.insert(k.clone(), v.clone());
            }
        }

        let mut changed = Vec::new();
        for (path, value) in &merged {
            // Duration has its own "0 counts as unset" rule below.
            if path == "system.duration" {
                continue;
            }
            if jobspec.attr_get(path).is_none() {
                jobspec.attr_set(path, value.clone())?;
                changed.push((path.clone(), value.clone()));
            }
        }

        // duration == 0 is "unset": only default it in if truly absent or zero.
        if jobspec.duration() == 0.0
            && let Some(default_duration) = merged.get("system.duration")
        {
            let seconds = duration_default_seconds(default_duration)?;
            jobspec.attr_set("system.duration", serde_json::json!(seconds))?;
            changed.push(("system.duration".to_string(), serde_json::json!(seconds)));
        }
        Ok(changed)
    }
}

/// A `policy.jobspec.defaults` duration value may be given as an FSD string
/// (`"1h"`) or a plain number of seconds; convert either to seconds.
fn duration_default_seconds(v: &serde_json::Value) -> FluxResult<f64> {
    match v {
        serde_json::Value::String(s) => parse_fsd(s),
        _ => v
            .as_f64()
            .ok_or_else(|| FluxError::invalid("default system.duration must be a number or FSD string")),
    }
}

/// Parse an FSD (Flux Standard Duration) string like `"1h"`, `"90s"`,
/// `"2.5d"` into seconds. Bare numeric strings are seconds. Mirrors
/// `fsd_parse_duration`'s suffix table (s, m, h, d).
pub fn parse_fsd(s: &str) -> FluxResult<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FluxError::invalid("FSD duration string is empty"));
    }
    let (num_part, suffix) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - 1], c),
        _ => (s, 's'),
    };
    let base: f64 = num_part
        .parse()
        .map_err(|_| FluxError::invalid(format!("malformed FSD duration {s:?}")))?;
    let mult = match suffix {
        's' => 1.0,
        'm' => 60.0,
        'h' => 3600.0,
        'd' => 86400.0,
        other => return Err(FluxError::invalid(format!("unknown FSD suffix {other:?}"))),
    };
    Ok(base * mult)
}

/// `limit-duration`: rejects a job whose requested duration exceeds the
/// queue (or general) limit. A finite limit rejects an unlimited (0)
/// request; a 0 limit means unlimited and always passes. Queue override
/// wins wholesale over the general limit.
pub struct LimitDurationPlugin;

impl ValidatePlugin for LimitDurationPlugin {
    fn name(&self) -> &'static str {
        "limit-duration"
    }

    fn validate(&self, jobspec: &Jobspec, queue: Option<&QueuePolicy>, cfg: &PolicyConfig) -> FluxResult<()> {
        let limit = match queue.and_then(|q| q.duration_limit) {
            Some(d) => Some(d),
            None => cfg.general_duration_limit,
        };
        let Some(limit) = limit else {
            return Ok(());
        };
        if limit.is_unlimited() {
            return Ok(());
        }
        let requested = jobspec.duration();
        if requested == 0.0 {
            return Err(FluxError::invalid(format!(
                "duration limit is {}s; unlimited duration is not permitted",
                limit.0
            )));
        }
        if requested > limit.0 {
            return Err(FluxError::invalid(format!(
                "duration {requested}s exceeds limit of {}s",
                limit.0
            )));
        }
        Ok(())
    }
}

/// `limit-job-size`: per-axis nnodes/ncores/ngpus bound check, `-1` meaning
/// unlimited on that axis. Queue override replaces the whole limit set for
/// a given axis, like `limit-duration`.
pub struct LimitJobSizePlugin;

impl ValidatePlugin for LimitJobSizePlugin {
    fn name(&self) -> &'static str {
        "limit-job-size"
    }

    fn validate(&self, jobspec: &Jobspec, queue: Option<&QueuePolicy>, cfg: &PolicyConfig) -> FluxResult<()> {
        let limit = match queue.and_then(|q| q.size_limit) {
            Some(l) => Some(l),
            None => cfg.general_size_limit,
        };
        let Some(limit) = limit else {
            return Ok(());
        };
        let counts = jobspec.resource_counts()?;

        check_axis("nnodes", counts.nnodes, limit.max_nnodes, limit.min_nnodes)?;
        check_axis("ncores", counts.ncores, limit.max_ncores, limit.min_ncores)?;
        check_axis("ngpus", counts.ngpus, limit.max_ngpus, limit.min_ngpus)?;
        Ok(())
    }
}

fn check_axis(axis: &str, requested: i64, max: i64, min: i64) -> FluxResult<()> {
    if max != -1 && requested > max {
        return Err(FluxError::invalid(format!(
            "job {axis}={requested} exceeds max of {max}"
        )));
    }
    if min != -1 && requested < min {
        return Err(FluxError::invalid(format!(
            "job {axis}={requested} is below min of {min}"
        )));
    }
    Ok(())
}

/// The fixed plugin pipeline run by the ingest path: defaults first, then
/// every validator in order, stopping at the first rejection.
pub struct PolicyPipeline {
    create: Vec<Box<dyn CreatePlugin + Send + Sync>>,
    validate: Vec<Box<dyn ValidatePlugin + Send + Sync>>,
}

impl Default for PolicyPipeline {
    fn default() -> Self {
        PolicyPipeline {
            create: vec![Box::new(JobspecDefaultPlugin)],
            validate: vec![Box::new(LimitDurationPlugin), Box::new(LimitJobSizePlugin)],
        }
    }
}

impl PolicyPipeline {
    /// Run `job.create` hooks. Only meaningful when the job is newly
    /// submitted (`state == NEW`); the caller is responsible for that check
    /// since this module has no notion of job state.
    pub fn run_create(
        &self,
        jobspec: &mut Jobspec,
        cfg: &PolicyConfig,
    ) -> FluxResult<Vec<(String, String, serde_json::Value)>> {
        let queue = resolve_queue(jobspec, cfg);
        let mut events = Vec::new();
        for plugin in &self.create {
            for (path, value) in plugin.apply(jobspec, queue, cfg)? {
                events.push((plugin.name().to_string(), path, value));
            }
        }
        Ok(events)
    }

    pub fn run_validate(&self, jobspec: &Jobspec, cfg: &PolicyConfig) -> FluxResult<()> {
        let queue = resolve_queue(jobspec, cfg);
        for plugin in &self.validate {
            plugin
                .validate(jobspec, queue, cfg)
                .map_err(|e| FluxError::invalid(format!("{}: {e}", plugin.name())))?;
        }
        Ok(())
    }
}

/// Queue name resolution: the jobspec's own `system.queue` if set, else the
/// general-default queue configured at `policy.jobspec.defaults.system.queue`.
/// A named-but-unconfigured queue resolves to `None` rather than an error
/// (SPEC_FULL §9, Open Question decision #4).
fn resolve_queue<'a>(jobspec: &Jobspec, cfg: &'a PolicyConfig) -> Option<&'a QueuePolicy> {
    let name = jobspec
        .queue()
        .or_else(|| cfg.general_defaults.get("system.queue").and_then(|v| v.as_str()));
    name.and_then(|q| cfg.queues.get(q))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobspec::Jobspec;

    fn minimal_jobspec() -> Jobspec {
        Jobspec::from_command(&["hostname".to_string()], &[], 1, 1, 0, 0, 0.0).unwrap()
    }

    #[test]
    fn fsd_parses_suffixes() {
        assert_eq!(parse_fsd("90").unwrap(), 90.0);
        assert_eq!(parse_fsd("2m").unwrap(), 120.0);
        assert_eq!(parse_fsd("1h").unwrap(), 3600.0);
        assert_eq!(parse_fsd("1d").unwrap(), 86400.0);
    }

    #[test]
    fn jobspec_default_fills_unset_duration_from_fsd_string() {
        let mut js = minimal_jobspec();
        let mut general_defaults = HashMap::new();
        general_defaults.insert("system.duration".to_string(), serde_json::json!("1h"));
        let cfg = PolicyConfig {
            general_defaults,
            ..Default::default()
        };
        let plugin = JobspecDefaultPlugin;
        let changed = plugin.apply(&mut js, None, &cfg).unwrap();
        assert!(changed.iter().any(|(p, _)| p == "system.duration"));
        assert_eq!(js.duration(), 3600.0);
    }

    #[test]
    fn jobspec_default_leaves_set_duration_alone() {
        let mut js = minimal_jobspec();
        js.attr_set("system.duration", serde_json::json!(30.0)).unwrap();
        let mut general_defaults = HashMap::new();
        general_defaults.insert("system.duration".to_string(), serde_json::json!("1h"));
        let cfg = PolicyConfig {
            general_defaults,
            ..Default::default()
        };
        let plugin = JobspecDefaultPlugin;
        plugin.apply(&mut js, None, &cfg).unwrap();
        assert_eq!(js.duration(), 30.0);
    }

    #[test]
    fn resolve_queue_falls_back_to_general_default_queue() {
        let js = minimal_jobspec();
        let mut general_defaults = HashMap::new();
        general_defaults.insert("system.queue".to_string(), serde_json::json!("batch"));
        let mut queues = HashMap::new();
        queues.insert(
            "batch".to_string(),
            QueuePolicy {
                duration_limit: Some(Duration(60.0)),
                ..Default::default()
            },
        );
        let cfg = PolicyConfig {
            general_defaults,
            queues,
            ..Default::default()
        };
        assert_eq!(resolve_queue(&js, &cfg).unwrap().duration_limit, Some(Duration(60.0)));
    }

    #[test]
    fn jobspec_default_tolerates_unknown_queue() {
        let mut js = minimal_jobspec();
        js.attr_set("system.queue", serde_json::json!("nonexistent")).unwrap();
        let cfg = PolicyConfig::default();
        let plugin = JobspecDefaultPlugin;
        assert!(plugin.apply(&mut js, None, &cfg).is_ok());
    }

    #[test]
    fn limit_duration_rejects_unlimited_against_finite_limit() {
        let js = minimal_jobspec();
        let cfg = PolicyConfig {
            general_duration_limit: Some(Duration(60.0)),
            ..Default::default()
        };
        let plugin = LimitDurationPlugin;
        assert!(plugin.validate(&js, None, &cfg).is_err());
    }

    #[test]
    fn limit_duration_rejects_over_limit_and_accepts_within() {
        let mut js = minimal_jobspec();
        js.attr_set("system.duration", serde_json::json!(120.0)).unwrap();
        let cfg = PolicyConfig {
            general_duration_limit: Some(Duration(60.0)),
            ..Default::default()
        };
        let plugin = LimitDurationPlugin;
        assert!(plugin.validate(&js, None, &cfg).is_err());

        js.attr_set("system.duration", serde_json::json!(30.0)).unwrap();
        assert!(plugin.validate(&js, None, &cfg).is_ok());
    }

    #[test]
    fn limit_job_size_enforces_max_and_unlimited_sentinel() {
        let js = Jobspec::from_command(&["x".to_string()], &[], 8, 2, 0, 4, 0.0).unwrap();
        let cfg = PolicyConfig {
            general_size_limit: Some(SizeLimit {
                max_nnodes: 2,
                ..SizeLimit::default()
            }),
            ..Default::default()
        };
        let plugin = LimitJobSizePlugin;
        assert!(plugin.validate(&js, None, &cfg).is_err());

        let cfg_unlimited = PolicyConfig::default();
        assert!(plugin.validate(&js, None, &cfg_unlimited).is_ok());
    }

    #[test]
    fn limit_job_size_enforces_min_ncores_and_min_ngpus() {
        let js = Jobspec::from_command(&["x".to_string()], &[], 2, 1, 0, 0, 0.0).unwrap();
        let cfg = PolicyConfig {
            general_size_limit: Some(SizeLimit {
                min_ncores: 4,
                ..SizeLimit::default()
            }),
            ..Default::default()
        };
        let plugin = LimitJobSizePlugin;
        assert!(plugin.validate(&js, None, &cfg).is_err());

        let js_gpu = Jobspec::from_command(&["x".to_string()], &[], 2, 1, 1, 0, 0.0).unwrap();
        let cfg_gpu = PolicyConfig {
            general_size_limit: Some(SizeLimit {
                min_ngpus: 4,
                ..SizeLimit::default()
            }),
            ..Default::default()
        };
        assert!(plugin.validate(&js_gpu, None, &cfg_gpu).is_err());
    }

    #[test]
    fn pipeline_runs_create_then_validate() {
        let mut js = minimal_jobspec();
        let mut general_defaults = HashMap::new();
        general_defaults.insert("system.duration".to_string(), serde_json::json!("30m"));
        let cfg = PolicyConfig {
            general_defaults,
            general_duration_limit: Some(Duration(3600.0)),
            ..Default::default()
        };
        let pipeline = PolicyPipeline::default();
        pipeline.run_create(&mut js, &cfg).unwrap();
        assert_eq!(js.duration(), 1800.0);
        pipeline.run_validate(&js, &cfg).unwrap();
    }
}
