//! `mtstress`: drive rustls from many threads at once.

use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

use clap::{ArgAction, Parser};
use mtstress_core::{RunConfig, RunReport, WorkerOutcome, pipe::DEFAULT_CAPACITY, pool};
use mtstress_tls::{RunError, TlsLibrary, TlsSettings};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mtstress",
    version,
    about = "Multi-threaded TLS session stress test over in-memory pipes"
)]
struct Args {
    /// Number of worker threads (1..=100)
    #[arg(long, default_value_t = 10)]
    threads: usize,

    /// Connection attempts per worker
    #[arg(long, default_value_t = 10)]
    loops: usize,

    /// Reuse one session handle per role across a worker's attempts
    #[arg(long)]
    reconnect: bool,

    /// Print client and server context statistics
    #[arg(long)]
    stats: bool,

    /// Require and verify a client certificate
    #[arg(long)]
    client_auth: bool,

    /// Verify the server certificate against --ca-file/--ca-path
    #[arg(long)]
    server_auth: bool,

    /// PEM file with the server certificate chain and key
    #[arg(long, value_name = "PATH")]
    cert: Option<PathBuf>,

    /// PEM file with the client certificate chain and key
    #[arg(long, value_name = "PATH")]
    ccert: Option<PathBuf>,

    /// PEM bundle of trusted certificates
    #[arg(long, value_name = "PATH")]
    ca_file: Option<PathBuf>,

    /// Directory of trusted PEM certificates
    #[arg(long, value_name = "DIR")]
    ca_path: Option<PathBuf>,

    /// Name the client connects to
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Capacity of each in-memory pipe direction, in bytes
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pipe_capacity: usize,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn settings(&self) -> TlsSettings {
        TlsSettings {
            server_cert: self.cert.clone(),
            client_cert: self.ccert.clone(),
            ca_file: self.ca_file.clone(),
            ca_path: self.ca_path.clone(),
            server_auth: self.server_auth,
            client_auth: self.client_auth,
            server_name: self.server_name.clone(),
            ..TlsSettings::default()
        }
    }

    fn run_config(&self) -> RunConfig {
        RunConfig {
            threads: self.threads,
            iterations: self.loops,
            reuse_sessions: self.reconnect,
            pipe_capacity: self.pipe_capacity,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_thread_names(true)
        .init();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(%err, "mtstress failed");
            ExitCode::FAILURE
        },
    }
}

fn run(args: &Args) -> Result<bool, RunError> {
    let library = Arc::new(TlsLibrary::new(&args.settings())?);
    let report = pool::run(library, args.run_config())?;

    for worker in report.failed_workers() {
        match &worker.outcome {
            WorkerOutcome::Failed { iteration, error } => {
                warn!(worker = worker.worker, iteration, %error, "worker failed");
            },
            WorkerOutcome::Panicked => warn!(worker = worker.worker, "worker panicked"),
            WorkerOutcome::Completed => {},
        }
        for message in &worker.errors {
            warn!(worker = worker.worker, message = %message, "library error");
        }
    }

    print_report(&mut io::stdout().lock(), &report, args.stats)?;

    let success = report.is_success();
    info!(
        success,
        completed = report.completed_attempts(),
        expected = report.config.total_attempts(),
        "done"
    );
    Ok(success)
}

fn print_report(out: &mut impl Write, report: &RunReport, stats: bool) -> io::Result<()> {
    if stats {
        writeln!(out, "client context:")?;
        writeln!(out, "{}", report.client)?;
        writeln!(out, "server context:")?;
        writeln!(out, "{}", report.server)?;
    }

    writeln!(out, "lock counters:")?;
    for usage in report.locks.iter() {
        writeln!(out, "{:>8}:{}", usage.count, usage.name)?;
    }

    writeln!(
        out,
        "{} of {} attempts completed in {:.3}s",
        report.completed_attempts(),
        report.config.total_attempts(),
        report.elapsed.as_secs_f64()
    )?;
    writeln!(out, "{}", if report.is_success() { "done" } else { "failed" })
}
