//! Two-stage frobnicate → validate pipeline (spec §4.6).
//!
//! Grounded on
//! `original_source/src/modules/job-ingest/pipeline.c::pipeline_process_job`'s
//! decision tree: `NOVALIDATE` skips the validator; the frobnicator runs
//! first when enabled and its output becomes the authoritative jobspec;
//! when both stages are skipped the job is accepted immediately.

use serde_json::Value;

use crate::error::{FluxError, FluxResult};
use crate::jobspec::{Jobspec, WorkerRequest};
use crate::workcrew::Workcrew;

pub struct Pipeline {
    frobnicate: Option<Workcrew>,
    validate: Option<Workcrew>,
    frobnicate_enabled: bool,
}

impl Pipeline {
    pub fn new(frobnicate: Option<Workcrew>, validate: Option<Workcrew>, frobnicate_enabled: bool) -> Self {
        Pipeline {
            frobnicate,
            validate,
            frobnicate_enabled,
        }
    }

    /// Whether the frobnicator should run at all, per spec §4.6: explicitly
    /// configured, or any jobspec defaults or queues are configured.
    pub fn frobnicate_enabled(cfg: &crate::config::FluxConfig) -> bool {
        cfg.ingest.frobnicate_command.is_some()
            || !cfg.policy.jobspec.defaults.is_empty()
            || !cfg.queues.is_empty()
    }

    /// Run the configured stages over one job request, returning the final
    /// jobspec on success. `novalidate` corresponds to the submit request's
    /// `NOVALIDATE` flag.
    pub fn process_job(&self, req: &WorkerRequest, novalidate: bool) -> FluxResult<Jobspec> {
        let mut jobspec_value = req.jobspec.clone();

        if self.frobnicate_enabled
            && let Some(crew) = &self.frobnicate
        {
            let input = worker_input(&jobspec_value, req);
            let response = crew.process_job(input)?;
            jobspec_value = take_jobspec_or_reject(response)?;
        }

        if !novalidate
            && let Some(crew) = &self.validate
        {
            let input = worker_input(&jobspec_value, req);
            let response = crew.process_job(input)?;
            reject_if_errmsg(&response)?;
        }

        Ok(Jobspec::from_value(jobspec_value))
    }
}

fn worker_input(jobspec: &Value, req: &WorkerRequest) -> Value {
    serde_json::json!({
        "jobspec": jobspec,
        "userid": req.userid,
        "rolemask": req.rolemask,
        "urgency": req.urgency,
        "flags": req.flags,
    })
}

fn reject_if_errmsg(response: &Value) -> FluxResult<()> {
    if let Some(errmsg) = response.get("errmsg").and_then(Value::as_str)
        && !errmsg.is_empty()
    {
        return Err(FluxError::invalid(errmsg.to_string()));
    }
    Ok(())
}

/// The frobnicator's response is either `{errmsg: "<reason>"}` (nonempty)
/// or the full replacement jobspec object.
fn take_jobspec_or_reject(response: Value) -> FluxResult<Value> {
    reject_if_errmsg(&response)?;
    if response.get("errmsg").is_some() {
        // {"errmsg": ""} success marker carrying no replacement: keep as-is
        // is not a valid frobnicator contract (it must return a jobspec),
        // but tolerate it defensively by treating it as "no change".
        return Err(FluxError::ProtocolError(
            "frobnicator returned an error marker instead of a jobspec".to_string(),
        ));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobspec::Jobspec;

    fn sample_request() -> WorkerRequest {
        let jobspec = Jobspec::from_command(&["hostname".to_string()], &[], 1, 1, 0, 0, 60.0).unwrap();
        WorkerRequest {
            jobspec: jobspec.as_value().clone(),
            userid: 1000,
            rolemask: 0,
            urgency: 16,
            flags: 0,
        }
    }

    #[test]
    fn both_stages_skipped_returns_input_unchanged() {
        let pipeline = Pipeline::new(None, None, false);
        let req = sample_request();
        let result = pipeline.process_job(&req, true).unwrap();
        assert_eq!(result.as_value(), &req.jobspec);
    }

    #[test]
    fn novalidate_skips_validator_even_if_configured() {
        // A validator pool that would reject everything must not run when
        // NOVALIDATE is set.
        let validate = Workcrew::spawn(vec!["false".to_string()], 1);
        let pipeline = Pipeline::new(None, Some(validate), false);
        let req = sample_request();
        assert!(pipeline.process_job(&req, true).is_ok());
    }
}
