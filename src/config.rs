//! Configuration loading and state-root resolution (SPEc-ambient, §0.3/§0.4).
//!
//! Grounded on the teacher's `resolve_root` precedence chain (flag, env var,
//! XDG data dir, built-in default), generalized to also resolve a TOML
//! policy/ingest config file using the same precedence shape.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{FluxError, FluxResult};
use crate::policy::PolicyConfig;

const ROOT_ENV: &str = "FLUX_INGEST_ROOT";
const CONFIG_ENV: &str = "FLUX_INGEST_CONFIG";

/// `[ingest]` table: batching and workcrew knobs (spec §4.5/§4.7).
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: f64,
    #[serde(default)]
    pub batch_count: Option<usize>,
    #[serde(default = "default_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default)]
    pub frobnicate_command: Option<Vec<String>>,
    #[serde(default)]
    pub validate_command: Option<Vec<String>>,
}

fn default_batch_timeout() -> f64 {
    0.01
}

fn default_concurrency() -> usize {
    4
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            batch_timeout_secs: default_batch_timeout(),
            batch_count: None,
            worker_concurrency: default_concurrency(),
            frobnicate_command: None,
            validate_command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FluxConfig {
    #[serde(default)]
    pub policy: PolicyConfigToml,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub queues: std::collections::HashMap<String, QueueConfigToml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfigToml {
    #[serde(default)]
    pub jobspec: JobspecDefaultsToml,
    #[serde(default)]
    pub limits: LimitsToml,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobspecDefaultsToml {
    #[serde(default)]
    pub defaults: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitsToml {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub job_size: Option<JobSizeToml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSizeToml {
    #[serde(default)]
    pub max: JobSizeBoundToml,
    #[serde(default)]
    pub min: JobSizeBoundToml,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSizeBoundToml {
    pub nnodes: Option<i64>,
    pub ncores: Option<i64>,
    pub ngpus: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueConfigToml {
    #[serde(default)]
    pub policy: PolicyConfigToml,
}

impl FluxConfig {
    /// `--config` flag, else `FLUX_INGEST_CONFIG`, else `$XDG_CONFIG_HOME/flux-ingest/config.toml`,
    /// else an empty built-in default (SPEC_FULL §0.3).
    pub fn resolve(flag: Option<&str>) -> FluxResult<Self> {
        if let Some(path) = flag {
            return Self::load(Path::new(path));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        if let Some(dirs) = directories::ProjectDirs::from("", "", "flux-ingest") {
            let path = dirs.config_dir().join("config.toml");
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(FluxConfig::default())
    }

    fn load(path: &Path) -> FluxResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FluxError::invalid(format!("reading config {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| FluxError::invalid(format!("parsing config {}: {e}", path.display())))
    }

    /// Translate the TOML shape into the runtime `PolicyConfig` used by
    /// `crate::policy`, resolving FSD duration strings to seconds.
    pub fn to_policy_config(&self) -> FluxResult<PolicyConfig> {
        let general_duration_limit = match &self.policy.limits.duration {
            Some(s) => Some(crate::policy::Duration(crate::policy::parse_fsd(s)?)),
            None => None,
        };
        let general_size_limit = self.policy.limits.job_size.as_ref().map(to_size_limit);

        let mut queues = std::collections::HashMap::new();
        for (name, q) in &self.queues {
            let duration_limit = match &q.policy.limits.duration {
                Some(s) => Some(crate::policy::Duration(crate::policy::parse_fsd(s)?)),
                None => None,
            };
            let size_limit = q.policy.limits.job_size.as_ref().map(to_size_limit);
            queues.insert(
                name.clone(),
                crate::policy::QueuePolicy {
                    defaults: q.policy.jobspec.defaults.clone(),
                    duration_limit,
                    size_limit,
                },
            );
        }

        Ok(PolicyConfig {
            general_defaults: self.policy.jobspec.defaults.clone(),
            general_duration_limit,
            general_size_limit,
            queues,
        })
    }
}

fn to_size_limit(j: &JobSizeToml) -> crate::policy::SizeLimit {
    crate::policy::SizeLimit {
        max_nnodes: j.max.nnodes.unwrap_or(-1),
        max_ncores: j.max.ncores.unwrap_or(-1),
        max_ngpus: j.max.ngpus.unwrap_or(-1),
        min_nnodes: j.min.nnodes.unwrap_or(-1),
        min_ncores: j.min.ncores.unwrap_or(-1),
        min_ngpus: j.min.ngpus.unwrap_or(-1),
    }
}

/// `--root` flag, else `FLUX_INGEST_ROOT`, else `$XDG_DATA_HOME/flux-ingest`,
/// else a `flux-ingest-state` directory under the system temp dir.
pub fn resolve_root(flag: Option<&str>) -> FluxResult<PathBuf> {
    if let Some(root) = flag {
        return Ok(PathBuf::from(root));
    }
    if let Ok(root) = std::env::var(ROOT_ENV) {
        return Ok(PathBuf::from(root));
    }
    if let Some(dirs) = directories::ProjectDirs::from("", "", "flux-ingest") {
        return Ok(dirs.data_dir().to_path_buf());
    }
    Ok(std::env::temp_dir().join("flux-ingest-state"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_root_prefers_explicit_flag() {
        let root = resolve_root(Some("/tmp/explicit")).unwrap();
        assert_eq!(root, PathBuf::from("/tmp/explicit"));
    }

    #[test]
    fn default_config_has_no_limits() {
        let cfg = FluxConfig::default();
        let policy = cfg.to_policy_config().unwrap();
        assert!(policy.general_duration_limit.is_none());
        assert!(policy.general_size_limit.is_none());
    }

    #[test]
    fn toml_config_parses_limits_and_queue_override() {
        let toml_src = r#"
[policy.limits]
duration = "1h"

[queues.debug.policy.limits]
duration = "0"
"#;
        let cfg: FluxConfig = toml::from_str(toml_src).unwrap();
        let policy = cfg.to_policy_config().unwrap();
        assert_eq!(policy.general_duration_limit.unwrap().0, 3600.0);
        assert!(
            policy
                .queues
                .get("debug")
                .unwrap()
                .duration_limit
                .unwrap()
                .is_unlimited()
        );
    }

    #[test]
    fn toml_config_parses_min_ncores_and_min_ngpus() {
        let toml_src = r#"
[policy.limits.job_size.min]
ncores = 4
ngpus = 1
"#;
        let cfg: FluxConfig = toml::from_str(toml_src).unwrap();
        let policy = cfg.to_policy_config().unwrap();
        let limit = policy.general_size_limit.unwrap();
        assert_eq!(limit.min_ncores, 4);
        assert_eq!(limit.min_ngpus, 1);
        assert_eq!(limit.min_nnodes, -1);
    }

    #[test]
    fn toml_config_parses_jobspec_defaults() {
        let toml_src = r#"
[policy.jobspec.defaults]
"system.duration" = "1h"
"system.queue" = "batch"
"#;
        let cfg: FluxConfig = toml::from_str(toml_src).unwrap();
        let policy = cfg.to_policy_config().unwrap();
        assert_eq!(
            policy.general_defaults.get("system.duration").unwrap(),
            "1h"
        );
        assert_eq!(policy.general_defaults.get("system.queue").unwrap(), "batch");
    }
}
