//! In-process default implementation of the frobnicate/validate worker
//! role, spoken over NDJSON on stdin/stdout (spec §4.5.1).
//!
//! This lets `workcrew` spawn `std::env::current_exe()` itself as the
//! default configured command when no external `job-validator`/
//! `job-frobnicator` binary is configured, the same way the teacher's
//! `run.rs` re-execs itself for its own `_supervise` hidden subcommand.

use std::io::{BufRead, Write};

use serde::Deserialize;
use serde_json::Value;

use crate::config::FluxConfig;
use crate::error::FluxResult;
use crate::jobspec::Jobspec;
use crate::policy::PolicyPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Frobnicate,
    Validate,
}

#[derive(Debug, Deserialize)]
struct WorkerLine {
    jobspec: Value,
    #[serde(default)]
    #[allow(dead_code)]
    userid: u32,
    #[serde(default)]
    #[allow(dead_code)]
    rolemask: u32,
    #[serde(default)]
    #[allow(dead_code)]
    urgency: i32,
    #[serde(default)]
    #[allow(dead_code)]
    flags: u32,
}

/// Run the worker loop to completion (EOF on stdin). Reads one JSON
/// request per line, writes one JSON response per line.
pub fn run(role: Role, cfg: &FluxConfig) -> FluxResult<()> {
    let policy = cfg.to_policy_config()?;
    let pipeline = PolicyPipeline::default();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line.map_err(crate::error::FluxError::Io)?;
        if line.is_empty() {
            continue;
        }
        let response = handle_line(role, &line, &policy, &pipeline);
        writeln!(out, "{}", serde_json::to_string(&response).expect("response always serializes"))
            .map_err(crate::error::FluxError::Io)?;
        out.flush().map_err(crate::error::FluxError::Io)?;
    }
    Ok(())
}

fn handle_line(
    role: Role,
    line: &str,
    policy: &crate::policy::PolicyConfig,
    pipeline: &PolicyPipeline,
) -> Value {
    let parsed: Result<WorkerLine, _> = serde_json::from_str(line);
    let req = match parsed {
        Ok(r) => r,
        Err(e) => return serde_json::json!({"errmsg": format!("malformed request: {e}")}),
    };
    let mut jobspec = Jobspec::from_value(req.jobspec);

    match role {
        Role::Frobnicate => match pipeline.run_create(&mut jobspec, policy) {
            Ok(_events) => jobspec.as_value().clone(),
            Err(e) => serde_json::json!({"errmsg": e.to_string()}),
        },
        Role::Validate => match jobspec.validate().and_then(|_| pipeline.run_validate(&jobspec, policy)) {
            Ok(()) => serde_json::json!({"errmsg": ""}),
            Err(e) => serde_json::json!({"errmsg": e.to_string()}),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_role_accepts_minimal_jobspec() {
        let jobspec = Jobspec::from_command(&["hostname".to_string()], &[], 1, 1, 0, 0, 60.0).unwrap();
        let cfg = FluxConfig::default();
        let policy = cfg.to_policy_config().unwrap();
        let pipeline = PolicyPipeline::default();
        let line = serde_json::json!({"jobspec": jobspec.as_value(), "userid": 1000, "rolemask": 0, "urgency": 16, "flags": 0}).to_string();
        let response = handle_line(Role::Validate, &line, &policy, &pipeline);
        assert_eq!(response["errmsg"], "");
    }

    #[test]
    fn frobnicate_role_fills_duration_default() {
        let jobspec = Jobspec::from_command(&["hostname".to_string()], &[], 1, 1, 0, 0, 0.0).unwrap();
        let mut cfg = FluxConfig::default();
        cfg.policy
            .jobspec
            .defaults
            .insert("system.duration".to_string(), serde_json::json!("1h"));
        let policy = cfg.to_policy_config().unwrap();
        let pipeline = PolicyPipeline::default();
        let line = serde_json::json!({"jobspec": jobspec.as_value(), "userid": 1000, "rolemask": 0, "urgency": 16, "flags": 0}).to_string();
        let response = handle_line(Role::Frobnicate, &line, &policy, &pipeline);
        assert_eq!(response["attributes"]["system"]["duration"], 3600.0);
    }
}
