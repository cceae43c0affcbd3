//! CLI subcommand executors: the thin layer that turns parsed `main.rs`
//! arguments into calls against `ingest`/`attach`/`config`/`schema` and
//! prints the resulting `Response<T>`/`ErrorResponse` JSON line (spec §6).
//!
//! Grounded on the teacher's `run.rs`/`status.rs` command-execution shape:
//! one `execute(Opts) -> anyhow::Result<()>` function per subcommand, with
//! all stdout output going through `schema::Response`/`ErrorResponse`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::FluxConfig;
use crate::fluid::Fluid;
use crate::ingest::{IngestContext, SubmitRequest};
use crate::jobspec::Jobspec;
use crate::pipeline::Pipeline;
use crate::schema::{AttachData, CancelData, JobSummary, ListData, SchemaData, StatusData, SubmitData};
use crate::workcrew::Workcrew;

const JOBSPEC_V1_SCHEMA: &str = include_str!("../schema/jobspec-v1.schema.json");

/// This deployment has no broker/multi-user transport (explicit Non-goal);
/// the process invoking the CLI plays the instance owner role directly,
/// and the envelope's signer userid is always the caller's real uid.
fn caller_identity() -> (u32, bool) {
    let uid = unsafe { libc::getuid() };
    (uid, true)
}

fn default_worker_command(role: &str) -> Result<Vec<String>> {
    let exe = std::env::current_exe().context("resolving current executable path")?;
    Ok(vec![
        exe.to_string_lossy().to_string(),
        "_worker".to_string(),
        role.to_string(),
    ])
}

fn build_pipeline(cfg: &FluxConfig) -> Result<Pipeline> {
    let frobnicate_enabled = Pipeline::frobnicate_enabled(cfg);
    let frobnicate = if frobnicate_enabled {
        let command = cfg
            .ingest
            .frobnicate_command
            .clone()
            .map(Ok)
            .unwrap_or_else(|| default_worker_command("frobnicate"))?;
        Some(Workcrew::spawn(command, cfg.ingest.worker_concurrency))
    } else {
        None
    };
    let validate_command = cfg
        .ingest
        .validate_command
        .clone()
        .map(Ok)
        .unwrap_or_else(|| default_worker_command("validate"))?;
    let validate = Some(Workcrew::spawn(validate_command, cfg.ingest.worker_concurrency));
    Ok(Pipeline::new(frobnicate, validate, frobnicate_enabled))
}

pub struct SubmitOpts {
    pub root: Option<String>,
    pub config: Option<String>,
    pub queue: Option<String>,
    pub urgency: i32,
    pub novalidate: bool,
    pub waitable: bool,
    pub debug: bool,
    pub jobspec_path: Option<String>,
    pub command: Vec<String>,
    pub ntasks: i64,
    pub cores_per_task: i64,
    pub gpus_per_task: i64,
    pub nnodes: i64,
    pub duration: f64,
    pub env: Vec<String>,
}

pub fn submit(opts: SubmitOpts) -> Result<()> {
    let root = crate::config::resolve_root(opts.root.as_deref())?;
    let cfg = FluxConfig::resolve(opts.config.as_deref())?;
    let policy = cfg.to_policy_config()?;
    let pipeline = build_pipeline(&cfg)?;
    let fluid = crate::fluid::FluidGenerator::init(0, 0)?;
    let mut ctx = IngestContext::new(root, fluid, policy, pipeline);

    let mut jobspec = if let Some(path) = &opts.jobspec_path {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading jobspec file {path}"))?;
        Jobspec::decode(&text)?
    } else {
        let env: Vec<(String, String)> = opts
            .env
            .iter()
            .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect();
        Jobspec::from_command(
            &opts.command,
            &env,
            opts.ntasks,
            opts.cores_per_task,
            opts.gpus_per_task,
            opts.nnodes,
            opts.duration,
        )?
    };
    if let Some(queue) = &opts.queue {
        jobspec.attr_set("system.queue", serde_json::json!(queue))?;
    }

    let (uid, is_owner) = caller_identity();
    let envelope = crate::envelope::wrap_none(jobspec.encode().as_bytes(), uid);

    let mut flags = 0u32;
    if opts.novalidate {
        flags |= crate::ingest::FLAG_NOVALIDATE;
    }
    if opts.waitable {
        flags |= crate::ingest::FLAG_WAITABLE;
    }
    if opts.debug {
        flags |= crate::ingest::FLAG_DEBUG;
    }

    let id = ctx.submit(SubmitRequest {
        envelope,
        urgency: opts.urgency,
        flags,
        authenticated_userid: uid,
        is_owner,
    })?;

    crate::schema::Response::new(
        "submit",
        SubmitData {
            job_id: id.dotted(),
            job_id_f58: id.f58(),
            state: "depend".to_string(),
        },
    )
    .print();
    Ok(())
}

fn resolve_job_id(s: &str) -> Result<String> {
    if s.contains('.') {
        return Ok(s.to_string());
    }
    let id = Fluid::from_f58(s)?;
    Ok(id.dotted())
}

fn derive_state(events: &[String]) -> String {
    if events.iter().any(|e| e == "clean") {
        "inactive".to_string()
    } else if events.iter().any(|e| e == "finish") {
        "cleanup".to_string()
    } else if events.iter().any(|e| e == "start") {
        "run".to_string()
    } else if events.iter().any(|e| e == "alloc") {
        "sched".to_string()
    } else if events.iter().any(|e| e == "depend" || e == "priority") {
        "depend".to_string()
    } else {
        "new".to_string()
    }
}

fn read_events(root: &Path, dotted: &str) -> Result<(Vec<String>, Option<i32>)> {
    let mut tail = crate::eventlog::Tail::open(crate::eventlog::eventlog_path(root, dotted, "eventlog"));
    let mut names = Vec::new();
    let mut exit_code = None;
    loop {
        let (entries, done) = tail.poll()?;
        if entries.is_empty() {
            break;
        }
        for e in &entries {
            if e.name == "finish"
                && let Some(status) = e.context.as_ref().and_then(|c| c.get("status")).and_then(|v| v.as_i64())
            {
                exit_code = Some(status as i32);
            }
            names.push(e.name.clone());
        }
        if done {
            break;
        }
    }
    Ok((names, exit_code))
}

pub fn status(root: Option<String>, job_id: &str) -> Result<()> {
    let root = crate::config::resolve_root(root.as_deref())?;
    let dotted = resolve_job_id(job_id)?;
    let manifest_bytes = crate::kvs::read_key(&root, &format!("job.{dotted}/manifest"))?;
    let manifest: serde_json::Value = serde_json::from_slice(&manifest_bytes)?;
    let (events, exit_code) = read_events(&root, &dotted)?;
    let data = StatusData {
        job_id: dotted,
        state: derive_state(&events),
        urgency: manifest.get("urgency").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        t_submit: manifest.get("t_submit").and_then(|v| v.as_f64()).unwrap_or(0.0),
        exit_code,
        events,
    };
    crate::schema::Response::new("status", data).print();
    Ok(())
}

fn discover_jobs(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let job_dir = root.join("job");
    let Ok(ts_entries) = std::fs::read_dir(&job_dir) else {
        return out;
    };
    for ts in ts_entries.flatten() {
        let Ok(gen_entries) = std::fs::read_dir(ts.path()) else { continue };
        for gen in gen_entries.flatten() {
            let Ok(seq_entries) = std::fs::read_dir(gen.path()) else { continue };
            for seq in seq_entries.flatten() {
                if seq.path().join("manifest").is_file() {
                    let ts_name = ts.file_name().to_string_lossy().to_string();
                    let gen_name = gen.file_name().to_string_lossy().to_string();
                    let seq_name = seq.file_name().to_string_lossy().to_string();
                    out.push(format!("{ts_name}.{gen_name}.{seq_name}"));
                }
            }
        }
    }
    out.sort();
    out
}

pub fn list(root: Option<String>, limit: Option<usize>) -> Result<()> {
    let root = crate::config::resolve_root(root.as_deref())?;
    let mut dotted_ids = discover_jobs(&root);
    let truncated = matches!(limit, Some(n) if dotted_ids.len() > n);
    if let Some(n) = limit {
        dotted_ids.truncate(n);
    }
    let mut jobs = Vec::new();
    for dotted in &dotted_ids {
        let Ok(manifest_bytes) = crate::kvs::read_key(&root, &format!("job.{dotted}/manifest")) else {
            continue;
        };
        let Ok(manifest) = serde_json::from_slice::<serde_json::Value>(&manifest_bytes) else {
            continue;
        };
        let (events, _) = read_events(&root, dotted).unwrap_or_default();
        jobs.push(JobSummary {
            job_id: dotted.clone(),
            state: derive_state(&events),
            urgency: manifest.get("urgency").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            t_submit: manifest.get("t_submit").and_then(|v| v.as_f64()).unwrap_or(0.0),
        });
    }
    crate::schema::Response::new(
        "list",
        ListData {
            root: root.to_string_lossy().to_string(),
            jobs,
            truncated,
        },
    )
    .print();
    Ok(())
}

pub fn cancel(root: Option<String>, job_id: &str, message: &str) -> Result<()> {
    let root = crate::config::resolve_root(root.as_deref())?;
    let dotted = resolve_job_id(job_id)?;
    crate::ingest::cancel(&root, &dotted, message)?;
    crate::schema::Response::new("cancel", CancelData { job_id: dotted }).print();
    Ok(())
}

pub fn attach(root: Option<String>, job_id: &str, opts: crate::attach::AttachOptions) -> Result<i32> {
    let root = crate::config::resolve_root(root.as_deref())?;
    let dotted = resolve_job_id(job_id)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let exit_code = crate::attach::run(&root, &dotted, &opts, &mut out)?;
    crate::schema::Response::new(
        "attach",
        AttachData {
            job_id: dotted,
            exit_code,
        },
    )
    .print();
    Ok(exit_code)
}

pub fn schema() -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(JOBSPEC_V1_SCHEMA)?;
    crate::schema::Response::new("schema", SchemaData { schema: value }).print();
    Ok(())
}

/// Hidden `_worker` subcommand entry point.
pub fn run_worker(role: &str, config: Option<String>) -> Result<()> {
    let cfg = FluxConfig::resolve(config.as_deref())?;
    let role = match role {
        "frobnicate" => crate::worker_cmd::Role::Frobnicate,
        "validate" => crate::worker_cmd::Role::Validate,
        other => anyhow::bail!("unknown worker role {other}"),
    };
    crate::worker_cmd::run(role, &cfg)?;
    Ok(())
}
