//! flux-ingest — entry point
//!
//! All stdout is JSON only (one line per command, via `schema::Response`
//! / `schema::ErrorResponse`). Tracing logs go to stderr.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flux_ingest::attach::AttachOptions;
use flux_ingest::schema::ErrorResponse;

#[derive(Debug, Parser)]
#[command(name = "flux-ingest")]
#[command(about = "Job ingest, policy, and attach core for a Flux-style HPC resource manager", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a job and print its assigned id.
    Submit {
        #[arg(long)]
        root: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        queue: Option<String>,
        #[arg(long, default_value = "16")]
        urgency: i32,
        #[arg(long)]
        novalidate: bool,
        #[arg(long)]
        waitable: bool,
        #[arg(long)]
        debug: bool,
        /// Read a full jobspec v1 document from this file instead of
        /// building one from a bare command line.
        #[arg(long)]
        jobspec: Option<String>,
        #[arg(long, default_value = "1")]
        ntasks: i64,
        #[arg(long = "cores-per-task", default_value = "1")]
        cores_per_task: i64,
        #[arg(long = "gpus-per-task", default_value = "0")]
        gpus_per_task: i64,
        #[arg(long, default_value = "0")]
        nnodes: i64,
        #[arg(long, default_value = "0")]
        duration: f64,
        #[arg(long = "env", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
        env: Vec<String>,
        /// Command and arguments to run (ignored when `--jobspec` is given).
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Print a job's current state and event history.
    Status {
        #[arg(long)]
        root: Option<String>,
        job_id: String,
    },

    /// List known jobs.
    List {
        #[arg(long)]
        root: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Cancel a job.
    Cancel {
        #[arg(long)]
        root: Option<String>,
        #[arg(long, default_value = "canceled by user")]
        message: String,
        job_id: String,
    },

    /// Attach to a running (or finished) job: tail its event/output logs,
    /// forward local stdin, and relay ctrl-C/ctrl-Z.
    Attach {
        #[arg(long)]
        root: Option<String>,
        /// Show primary eventlog events.
        #[arg(short = 'E', long = "show-events")]
        show_events: bool,
        /// Show exec eventlog events.
        #[arg(short = 'X', long = "show-exec")]
        show_exec: bool,
        /// Show a periodic status line.
        #[arg(long = "show-status")]
        show_status: bool,
        /// Wait for this event before exiting instead of the default.
        #[arg(short = 'w', long = "wait-event", default_value = "clean")]
        wait_event: String,
        /// Label output lines with the emitting rank.
        #[arg(short = 'l', long = "label-io")]
        label_io: bool,
        #[arg(short = 'v', long)]
        verbose: bool,
        #[arg(short = 'q', long)]
        quiet: bool,
        /// Do not forward stdin.
        #[arg(short = 'r', long = "read-only")]
        read_only: bool,
        #[arg(short = 'u', long)]
        unbuffered: bool,
        /// Ranks to forward stdin to.
        #[arg(short = 'i', long = "stdin-ranks", default_value = "all")]
        stdin_ranks: String,
        job_id: String,
    },

    /// Print the embedded jobspec v1 JSON Schema document.
    Schema,

    /// [Internal] default in-process frobnicate/validate worker.
    #[command(name = "_worker", hide = true)]
    Worker {
        #[arg(long)]
        config: Option<String>,
        role: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        if let Some(flux_err) = e.downcast_ref::<flux_ingest::error::FluxError>() {
            ErrorResponse::from_flux_error(flux_err).print();
        } else {
            ErrorResponse::new("internal_error", format!("{e:#}"), false).print();
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Submit {
            root,
            config,
            queue,
            urgency,
            novalidate,
            waitable,
            debug,
            jobspec,
            ntasks,
            cores_per_task,
            gpus_per_task,
            nnodes,
            duration,
            env,
            command,
        } => {
            flux_ingest::cli::submit(flux_ingest::cli::SubmitOpts {
                root,
                config,
                queue,
                urgency,
                novalidate,
                waitable,
                debug,
                jobspec_path: jobspec,
                command,
                ntasks,
                cores_per_task,
                gpus_per_task,
                nnodes,
                duration,
                env,
            })?;
        }

        Command::Status { root, job_id } => {
            flux_ingest::cli::status(root, &job_id)?;
        }

        Command::List { root, limit } => {
            flux_ingest::cli::list(root, limit)?;
        }

        Command::Cancel { root, message, job_id } => {
            flux_ingest::cli::cancel(root, &job_id, &message)?;
        }

        Command::Attach {
            root,
            show_events,
            show_exec,
            show_status,
            wait_event,
            label_io,
            verbose,
            quiet,
            read_only,
            unbuffered,
            stdin_ranks,
            job_id,
        } => {
            let exit_code = flux_ingest::cli::attach(
                root,
                &job_id,
                AttachOptions {
                    show_primary_events: show_events,
                    show_exec_events: show_exec,
                    show_status,
                    wait_event,
                    label_io,
                    verbose,
                    quiet,
                    read_only,
                    unbuffered,
                    stdin_ranks,
                },
            )?;
            std::process::exit(exit_code);
        }

        Command::Schema => {
            flux_ingest::cli::schema()?;
        }

        Command::Worker { config, role } => {
            flux_ingest::cli::run_worker(&role, config)?;
        }
    }
    Ok(())
}
