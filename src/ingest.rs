//! Ingest batch: accept one submit request, run it through the policy
//! pipeline, assign a FLUID, and commit it to the KVS-equivalent store
//! (spec §4.7).
//!
//! Grounded on `original_source/src/modules/job-ingest/job-ingest.c` (batch
//! add/flush/announce/cleanup chain) and `job.c`
//! (`job_create_from_request`'s flag/urgency/role checks, with the precise
//! errno mapping this crate follows exactly — SPEC_FULL §7). This crate has
//! no broker, so one CLI `submit` invocation is a batch of exactly one job;
//! the batch/announce machinery still runs (assign → stage KVS txn → commit
//! → "announce", i.e. write the joblist manifest; any failure past
//! assignment triggers the same cleanup-unlink path the original batches
//! use for a whole-batch rejection).

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::envelope::{self, OWNER_USERID};
use crate::error::{FluxError, FluxResult};
use crate::eventlog::{self, Entry};
use crate::fluid::{Fluid, FluidGenerator};
use crate::jobspec::{Jobspec, WorkerRequest};
use crate::kvs::KvsTxn;
use crate::pipeline::Pipeline;
use crate::policy::PolicyConfig;

pub const URGENCY_MIN: i32 = 0;
pub const URGENCY_MAX: i32 = 31;
pub const URGENCY_DEFAULT: i32 = 16;

pub const FLAG_DEBUG: u32 = 1;
pub const FLAG_WAITABLE: u32 = 2;
pub const FLAG_NOVALIDATE: u32 = 4;

/// A `job-ingest.submit` request (spec §6), already credentialed by the
/// connector (here: the CLI process's own effective uid, see `cli::submit`).
pub struct SubmitRequest {
    pub envelope: String,
    pub urgency: i32,
    pub flags: u32,
    pub authenticated_userid: u32,
    pub is_owner: bool,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Per-check errno precision (SPEC_FULL §7, resolved from `job.c`): urgency
/// above default and WAITABLE from a non-owner role are `invalid-argument`;
/// only NOVALIDATE from a non-owner role is `permission-denied`.
fn check_role_and_flags(req: &SubmitRequest) -> FluxResult<()> {
    if req.urgency < URGENCY_MIN || req.urgency > URGENCY_MAX {
        return Err(FluxError::invalid(format!(
            "urgency {} outside [{URGENCY_MIN}..{URGENCY_MAX}]",
            req.urgency
        )));
    }
    if req.urgency > URGENCY_DEFAULT && !req.is_owner {
        return Err(FluxError::invalid(
            "urgency above default requires the owner role",
        ));
    }
    if req.flags & FLAG_WAITABLE != 0 && !req.is_owner {
        return Err(FluxError::invalid(
            "WAITABLE flag requires the owner role",
        ));
    }
    if req.flags & FLAG_NOVALIDATE != 0 && !req.is_owner {
        return Err(FluxError::denied(
            "NOVALIDATE flag requires the owner role",
        ));
    }
    Ok(())
}

/// Remove `attributes.system.environment` before persisting (spec §3: "the
/// environment subtree is stripped after decode, recoverable from J").
fn strip_environment(jobspec: &Value) -> Value {
    let mut v = jobspec.clone();
    if let Some(system) = v
        .get_mut("attributes")
        .and_then(|a| a.get_mut("system"))
        .and_then(Value::as_object_mut)
    {
        system.remove("environment");
    }
    v
}

pub struct IngestContext {
    root: PathBuf,
    fluid: FluidGenerator,
    policy: PolicyConfig,
    pipeline: Pipeline,
    shutdown: bool,
}

impl IngestContext {
    pub fn new(root: PathBuf, fluid: FluidGenerator, policy: PolicyConfig, pipeline: Pipeline) -> Self {
        IngestContext {
            root,
            fluid,
            policy,
            pipeline,
            shutdown: false,
        }
    }

    pub fn shut_down(&mut self) {
        self.shutdown = true;
    }

    /// `job-ingest.submit`. Returns the assigned FLUID on success.
    pub fn submit(&mut self, req: SubmitRequest) -> FluxResult<Fluid> {
        if self.shutdown {
            return Err(FluxError::Unsupported("ingest is shut down".to_string()));
        }
        check_role_and_flags(&req)?;

        let env = envelope::unwrap(&req.envelope)?;
        envelope::check_envelope(&env, req.is_owner, req.authenticated_userid)?;

        let jobspec_value: Value = serde_json::from_slice(&env.payload)
            .map_err(|e| FluxError::invalid(format!("jobspec decode: {e}")))?;

        let rolemask = if req.is_owner { 1 } else { 0 };
        let worker_req = WorkerRequest {
            jobspec: jobspec_value,
            userid: env.signer_userid,
            rolemask,
            urgency: req.urgency,
            flags: req.flags,
        };

        let novalidate = req.flags & FLAG_NOVALIDATE != 0;
        let processed = self.pipeline.process_job(&worker_req, novalidate)?;
        processed.validate()?;

        let id = self.fluid.generate()?;
        if let Err(e) = self.commit_job(&id, &req.envelope, &processed, env.signer_userid, req.urgency, req.flags) {
            self.cleanup(&id);
            return Err(e);
        }
        Ok(id)
    }

    fn commit_job(
        &self,
        id: &Fluid,
        envelope_str: &str,
        jobspec: &Jobspec,
        userid: u32,
        urgency: i32,
        flags: u32,
    ) -> FluxResult<()> {
        let dotted = id.dotted();
        let mut txn = KvsTxn::new(&self.root);
        txn.put_json(&format!("job.{dotted}/J"), &Value::String(envelope_str.to_string()))?;
        let stripped = strip_environment(jobspec.as_value());
        txn.put_json(&format!("job.{dotted}/jobspec"), &stripped)?;
        txn.put_json(
            &format!("job.{dotted}/manifest"),
            &serde_json::json!({
                "id": id.0,
                "userid": userid,
                "urgency": urgency,
                "t_submit": now_secs(),
                "flags": flags,
            }),
        )?;
        txn.commit()?;

        let appender = eventlog::Appender::new(eventlog::eventlog_path(&self.root, &dotted, "eventlog"));
        let t = now_secs();
        appender.append(&Entry::new(t, "submit", None))?;
        if flags & FLAG_NOVALIDATE == 0 {
            appender.append(&Entry::new(t, "validate", None))?;
        }
        appender.append(&Entry::new(t, "depend", None))?;
        appender.append(&Entry::new(
            t,
            "priority",
            Some(serde_json::json!({"priority": urgency})),
        ))?;
        Ok(())
    }

    fn cleanup(&self, id: &Fluid) {
        let dotted = id.dotted();
        let mut txn = KvsTxn::new(&self.root);
        txn.unlink(&format!("job.{dotted}/J"));
        txn.unlink(&format!("job.{dotted}/jobspec"));
        txn.unlink(&format!("job.{dotted}/manifest"));
        let _ = txn.commit();
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

/// `cancel`: append the exception/finish/clean sequence a real job manager
/// would emit when a user-requested cancellation completes (spec §6's
/// "Attach consumes event-watch streams only" — this helper plays the job
/// manager's role for a self-contained deployment without a broker).
pub fn cancel(root: &std::path::Path, dotted: &str, message: &str) -> FluxResult<()> {
    if !crate::kvs::job_subtree_exists(root, dotted) {
        return Err(FluxError::NoSuchEntry(format!("no such job {dotted}")));
    }
    let appender = eventlog::Appender::new(eventlog::eventlog_path(root, dotted, "eventlog"));
    let t = now_secs();
    appender.append(&Entry::new(
        t,
        "exception",
        Some(serde_json::json!({"type": "cancel", "severity": 0, "note": message})),
    ))?;
    appender.append(&Entry::new(
        t,
        "finish",
        Some(serde_json::json!({"status": 15})),
    ))?;
    appender.append(&Entry::new(t, "clean", None))?;
    appender.close()?;
    Ok(())
}

pub fn is_owner_uid(uid: u32) -> bool {
    uid == OWNER_USERID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::wrap_none;
    use tempfile::tempdir;

    fn new_ctx(dir: &std::path::Path) -> IngestContext {
        let fluid = FluidGenerator::init(0, 0).unwrap();
        let policy = PolicyConfig::default();
        let pipeline = Pipeline::new(None, None, false);
        IngestContext::new(dir.to_path_buf(), fluid, policy, pipeline)
    }

    fn minimal_envelope(userid: u32) -> String {
        let jobspec = Jobspec::from_command(&["hostname".to_string()], &[], 1, 1, 0, 0, 60.0).unwrap();
        wrap_none(jobspec.encode().as_bytes(), userid)
    }

    #[test]
    fn accepted_submit_writes_kvs_subtree() {
        let dir = tempdir().unwrap();
        let mut ctx = new_ctx(dir.path());
        let req = SubmitRequest {
            envelope: minimal_envelope(1000),
            urgency: 16,
            flags: 0,
            authenticated_userid: 1000,
            is_owner: true,
        };
        let id = ctx.submit(req).unwrap();
        assert!(crate::kvs::job_subtree_exists(dir.path(), &id.dotted()));
    }

    #[test]
    fn userid_mismatch_is_rejected_with_no_kvs_write() {
        let dir = tempdir().unwrap();
        let mut ctx = new_ctx(dir.path());
        let req = SubmitRequest {
            envelope: minimal_envelope(1001),
            urgency: 16,
            flags: 0,
            authenticated_userid: 1000,
            is_owner: true,
        };
        let err = ctx.submit(req).unwrap_err();
        assert_eq!(err.code(), "permission-denied");
    }

    #[test]
    fn novalidate_from_non_owner_is_permission_denied() {
        let dir = tempdir().unwrap();
        let mut ctx = new_ctx(dir.path());
        let req = SubmitRequest {
            envelope: minimal_envelope(1000),
            urgency: 16,
            flags: FLAG_NOVALIDATE,
            authenticated_userid: 1000,
            is_owner: false,
        };
        let err = ctx.submit(req).unwrap_err();
        assert_eq!(err.code(), "permission-denied");
    }

    #[test]
    fn waitable_from_non_owner_is_invalid_argument() {
        let dir = tempdir().unwrap();
        let mut ctx = new_ctx(dir.path());
        let req = SubmitRequest {
            envelope: minimal_envelope(1000),
            urgency: 16,
            flags: FLAG_WAITABLE,
            authenticated_userid: 1000,
            is_owner: false,
        };
        let err = ctx.submit(req).unwrap_err();
        assert_eq!(err.code(), "invalid-argument");
    }

    #[test]
    fn successive_submits_yield_strictly_increasing_ids() {
        let dir = tempdir().unwrap();
        let mut ctx = new_ctx(dir.path());
        let id1 = ctx
            .submit(SubmitRequest {
                envelope: minimal_envelope(1000),
                urgency: 16,
                flags: 0,
                authenticated_userid: 1000,
                is_owner: true,
            })
            .unwrap();
        let id2 = ctx
            .submit(SubmitRequest {
                envelope: minimal_envelope(1000),
                urgency: 16,
                flags: 0,
                authenticated_userid: 1000,
                is_owner: true,
            })
            .unwrap();
        assert!(id2.0 > id1.0);
    }

    #[test]
    fn cancel_appends_terminal_events() {
        let dir = tempdir().unwrap();
        let mut ctx = new_ctx(dir.path());
        let id = ctx
            .submit(SubmitRequest {
                envelope: minimal_envelope(1000),
                urgency: 16,
                flags: 0,
                authenticated_userid: 1000,
                is_owner: true,
            })
            .unwrap();
        cancel(dir.path(), &id.dotted(), "user").unwrap();
        let mut tail = eventlog::Tail::open(eventlog::eventlog_path(dir.path(), &id.dotted(), "eventlog"));
        let (entries, done) = tail.poll().unwrap();
        assert!(entries.iter().any(|e| e.name == "exception"));
        assert!(entries.iter().any(|e| e.name == "clean"));
        assert!(done);
    }
}
