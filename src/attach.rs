//! Attach client state machine (spec §4.9).
//!
//! Grounded on `original_source/src/cmd/job/attach.c` — the single largest
//! grounding file in the pack: the three-eventlog-tail fan-in, the
//! ctrl-C/ctrl-Z signal dance, stdin forwarding, and status-line rendering.
//! Realized here as a single-threaded polling loop (this crate has no
//! libev-equivalent reactor; §9's design note says "use a self-pipe; do
//! not invoke non-async-signal-safe code inside the OS handler" — the
//! self-pipe is real, the "reactor" around it is a plain loop with a short
//! sleep between polls, matching the same no-shared-mutable-state shape
//! without pulling in an async runtime the rest of this crate doesn't use).

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{FluxError, FluxResult};
use crate::eventlog::{self, Entry};

pub struct AttachOptions {
    pub show_primary_events: bool,
    pub show_exec_events: bool,
    pub show_status: bool,
    pub wait_event: String,
    pub label_io: bool,
    pub verbose: bool,
    pub quiet: bool,
    pub read_only: bool,
    pub unbuffered: bool,
    pub stdin_ranks: String,
}

impl Default for AttachOptions {
    fn default() -> Self {
        AttachOptions {
            show_primary_events: false,
            show_exec_events: false,
            show_status: false,
            wait_event: "clean".to_string(),
            label_io: false,
            verbose: false,
            quiet: false,
            read_only: false,
            unbuffered: false,
            stdin_ranks: "all".to_string(),
        }
    }
}

// SIGINT/SIGTSTP self-pipe: the handler is async-signal-safe (one `write`
// call only); everything else happens on the main loop after `read`.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signum: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [signum as u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

struct SelfPipe {
    read_fd: i32,
}

impl SelfPipe {
    fn install() -> FluxResult<Self> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(FluxError::Io(std::io::Error::last_os_error()));
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        unsafe {
            let flags = libc::fcntl(read_fd, libc::F_GETFL);
            libc::fcntl(read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        SIGNAL_WRITE_FD.store(write_fd, Ordering::Relaxed);
        unsafe {
            libc::signal(libc::SIGINT, on_signal as usize);
            libc::signal(libc::SIGTSTP, on_signal as usize);
        }
        Ok(SelfPipe { read_fd })
    }

    fn poll_signal(&self) -> Option<i32> {
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        if n == 1 {
            Some(buf[0] as i32)
        } else {
            None
        }
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGTSTP, libc::SIG_DFL);
            libc::close(self.read_fd);
        }
        SIGNAL_WRITE_FD.store(-1, Ordering::Relaxed);
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Run the attach client to completion and return the process exit code
/// (spec §4.9's "Exit" rule: fatal exception forces a nonzero code).
pub fn run(root: &Path, dotted: &str, opts: &AttachOptions, out: &mut dyn Write) -> FluxResult<i32> {
    let manifest_bytes = crate::kvs::read_key(root, &format!("job.{dotted}/manifest"))?;
    let manifest: Value = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| FluxError::invalid(format!("manifest decode: {e}")))?;
    let t0 = manifest.get("t_submit").and_then(Value::as_f64).unwrap_or(0.0);

    let self_pipe = SelfPipe::install()?;

    let mut primary = eventlog::Tail::open(eventlog::eventlog_path(root, dotted, "eventlog"));
    let mut exec_tail: Option<eventlog::Tail> = None;
    let mut output_tail: Option<eventlog::Tail> = None;

    let mut primary_done = false;
    let mut exec_done = true;
    let mut output_done = true;
    let mut exec_started = false;
    let mut output_started = false;

    let mut fatal = false;
    let mut exit_code: i32 = 0;
    let mut wait_event_seen = false;

    let mut ctrl_c_at: Option<Instant> = None;
    let mut last_status = Instant::now();
    let mut status_msg = "submitted".to_string();

    loop {
        let (entries, done) = primary.poll()?;
        for entry in &entries {
            if opts.show_primary_events && !opts.quiet {
                writeln!(out, "{}", eventlog::format_entry(entry, t0)).map_err(FluxError::Io)?;
            }
            match entry.name.as_str() {
                "exception" => {
                    let severity = entry
                        .context
                        .as_ref()
                        .and_then(|c| c.get("severity"))
                        .and_then(Value::as_i64)
                        .unwrap_or(1);
                    if severity == 0 {
                        fatal = true;
                    }
                    status_msg = "exception".to_string();
                }
                "submit" => {
                    status_msg = "submitted".to_string();
                    if !exec_started {
                        exec_started = true;
                        exec_done = false;
                        exec_tail = Some(eventlog::Tail::open(eventlog::eventlog_path(
                            root, dotted, "exec-eventlog",
                        )));
                    }
                }
                "priority" => status_msg = "waiting for resources".to_string(),
                "alloc" => status_msg = "starting".to_string(),
                "start" => status_msg = "running".to_string(),
                "finish" => {
                    let status = entry
                        .context
                        .as_ref()
                        .and_then(|c| c.get("status"))
                        .and_then(Value::as_i64)
                        .unwrap_or(0);
                    exit_code = waitstatus_to_exitcode(status as i32);
                }
                "clean" => {
                    // Terminal event: the job manager retires the job and
                    // will never write to the exec/output logs again, even
                    // if they were never opened (e.g. canceled before start).
                    exec_done = true;
                    output_done = true;
                }
                name if name == opts.wait_event => {
                    wait_event_seen = true;
                }
                _ => {}
            }
        }
        if done {
            primary_done = true;
        }

        if let Some(tail) = exec_tail.as_mut() {
            let (entries, done) = tail.poll()?;
            for entry in &entries {
                if opts.show_exec_events && !opts.quiet {
                    writeln!(out, "{}", eventlog::format_entry(entry, t0)).map_err(FluxError::Io)?;
                }
                match entry.name.as_str() {
                    "shell.init" => {
                        if !output_started {
                            output_started = true;
                            output_done = false;
                            output_tail = Some(eventlog::Tail::open(eventlog::eventlog_path(
                                root, dotted, "output-eventlog",
                            )));
                        }
                    }
                    "log" => {
                        render_log_line(out, entry, opts.label_io)?;
                    }
                    "complete" => {
                        if !output_started {
                            output_started = true;
                            output_done = false;
                            output_tail = Some(eventlog::Tail::open(eventlog::eventlog_path(
                                root, dotted, "output-eventlog",
                            )));
                        }
                    }
                    _ => {}
                }
            }
            if done {
                exec_done = true;
            }
        }

        if let Some(tail) = output_tail.as_mut() {
            let (entries, done) = tail.poll()?;
            for entry in &entries {
                match entry.name.as_str() {
                    "data" => render_output_data(out, entry, opts.label_io)?,
                    "redirect" => {
                        if !opts.quiet {
                            render_redirect(out, entry)?;
                        }
                    }
                    "log" => render_log_line(out, entry, opts.label_io)?,
                    _ => {}
                }
            }
            if done {
                output_done = true;
            }
        }

        if let Some(signum) = self_pipe.poll_signal() {
            if signum == libc::SIGINT {
                if let Some(first) = ctrl_c_at {
                    if first.elapsed() < Duration::from_secs(2) {
                        crate::ingest::cancel(root, dotted, "interrupted by ctrl-C")?;
                    } else {
                        ctrl_c_at = Some(Instant::now());
                        if !opts.quiet {
                            writeln!(
                                out,
                                "one more ctrl-C within 2s to cancel or ctrl-Z to detach"
                            )
                            .map_err(FluxError::Io)?;
                        }
                    }
                } else {
                    ctrl_c_at = Some(Instant::now());
                    if !opts.quiet {
                        writeln!(
                            out,
                            "one more ctrl-C within 2s to cancel or ctrl-Z to detach"
                        )
                        .map_err(FluxError::Io)?;
                    }
                }
            } else if signum == libc::SIGTSTP {
                let within_window = ctrl_c_at.is_some_and(|t| t.elapsed() < Duration::from_secs(2));
                if within_window {
                    primary_done = true;
                    exec_done = true;
                    output_done = true;
                } else if !opts.quiet {
                    writeln!(out, "one more ctrl-Z to suspend").map_err(FluxError::Io)?;
                }
            }
        }

        if opts.show_status && last_status.elapsed() >= Duration::from_secs(1) {
            write!(out, "\rflux-job: {dotted} {status_msg}\r").map_err(FluxError::Io)?;
            out.flush().map_err(FluxError::Io)?;
            last_status = Instant::now();
        }

        if primary_done && exec_done && output_done {
            break;
        }
        let _ = wait_event_seen;
        std::thread::sleep(Duration::from_millis(20));
    }

    if fatal && exit_code == 0 {
        exit_code = 1;
    }
    Ok(exit_code)
}

/// POSIX waitpid-style encoded status to a shell-style exit code: a normal
/// exit's low byte is the exit code; a signal-terminated status maps to
/// `128 + signum` by convention in the original implementation's attach
/// path; here `status` already carries the signal number directly when
/// produced by `ingest::cancel` (finish `{status: <signum>}`).
fn waitstatus_to_exitcode(status: i32) -> i32 {
    if (0..256).contains(&status) {
        status
    } else {
        1
    }
}

fn render_output_data(out: &mut dyn Write, entry: &Entry, label_io: bool) -> FluxResult<()> {
    let Some(ctx) = &entry.context else { return Ok(()) };
    let stream = ctx.get("stream").and_then(Value::as_str).unwrap_or("stdout");
    let rank = ctx.get("rank").and_then(Value::as_i64).unwrap_or(0);
    let data = ctx.get("data").and_then(Value::as_str).unwrap_or("");
    if label_io {
        write!(out, "{rank}: {data}").map_err(FluxError::Io)?;
    } else {
        write!(out, "{data}").map_err(FluxError::Io)?;
    }
    let _ = stream;
    Ok(())
}

fn render_redirect(out: &mut dyn Write, entry: &Entry) -> FluxResult<()> {
    let Some(ctx) = &entry.context else { return Ok(()) };
    let rank = ctx.get("rank").and_then(Value::as_i64).unwrap_or(0);
    let stream = ctx.get("stream").and_then(Value::as_str).unwrap_or("stdout");
    let path = ctx.get("path").and_then(Value::as_str).unwrap_or("");
    writeln!(out, "{rank}: {stream} redirected to {path}").map_err(FluxError::Io)
}

fn render_log_line(out: &mut dyn Write, entry: &Entry, _label_io: bool) -> FluxResult<()> {
    let Some(ctx) = &entry.context else { return Ok(()) };
    let rank = ctx.get("rank").and_then(Value::as_i64).unwrap_or(0);
    let component = ctx.get("component").and_then(Value::as_str).unwrap_or("");
    let message = ctx
        .get("message")
        .or_else(|| ctx.get("data"))
        .and_then(Value::as_str)
        .unwrap_or("");
    writeln!(out, "{rank}: {component}: {message}").map_err(FluxError::Io)
}

/// Forward one chunk of local stdin as a `<service>.stdin`-equivalent
/// write against the job's stdin-forward log (no real exec shell exists in
/// this crate; the forwarded bytes are durably recorded so a test harness
/// can assert on them, per spec §4.9's stdin-forwarding contract).
pub fn forward_stdin(root: &Path, dotted: &str, ranks: &str, data: &str, eof: bool) -> FluxResult<()> {
    let appender = eventlog::Appender::new(eventlog::eventlog_path(root, dotted, "stdin-log"));
    appender.append(&Entry::new(
        now_secs(),
        "data",
        Some(serde_json::json!({"stream": "stdin", "ranks": ranks, "data": data, "eof": eof})),
    ))?;
    if eof {
        appender.close()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::wrap_none;
    use crate::fluid::FluidGenerator;
    use crate::ingest::{IngestContext, SubmitRequest};
    use crate::jobspec::Jobspec;
    use crate::pipeline::Pipeline;
    use crate::policy::PolicyConfig;
    use tempfile::tempdir;

    fn submit_one(root: &Path) -> String {
        let fluid = FluidGenerator::init(0, 0).unwrap();
        let pipeline = Pipeline::new(None, None, false);
        let mut ctx = IngestContext::new(root.to_path_buf(), fluid, PolicyConfig::default(), pipeline);
        let jobspec = Jobspec::from_command(&["hostname".to_string()], &[], 1, 1, 0, 0, 60.0).unwrap();
        let envelope = wrap_none(jobspec.encode().as_bytes(), 1000);
        let id = ctx
            .submit(SubmitRequest {
                envelope,
                urgency: 16,
                flags: 0,
                authenticated_userid: 1000,
                is_owner: true,
            })
            .unwrap();
        id.dotted()
    }

    #[test]
    fn attach_observes_canceled_job_and_exits_nonzero() {
        let dir = tempdir().unwrap();
        let dotted = submit_one(dir.path());
        crate::ingest::cancel(dir.path(), &dotted, "user").unwrap();

        let mut buf = Vec::new();
        let opts = AttachOptions {
            show_primary_events: true,
            ..Default::default()
        };
        let code = run(dir.path(), &dotted, &opts, &mut buf).unwrap();
        assert!(code >= 1);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("exception"));
    }

    #[test]
    fn waitstatus_to_exitcode_passes_through_small_values() {
        assert_eq!(waitstatus_to_exitcode(0), 0);
        assert_eq!(waitstatus_to_exitcode(15), 15);
    }
}
