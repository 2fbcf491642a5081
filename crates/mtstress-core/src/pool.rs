//! Worker fan-out and aggregate reporting.
//!
//! [`WorkerPool::run`] installs a fresh [`LockRegistry`] into the library,
//! then starts one named OS thread per worker. Each worker runs its
//! iterations back to back and stops at the first failed attempt; other
//! workers are unaffected. [`WorkerPool::join`] waits for every worker,
//! removes the callback, tears the registry down and labels the final
//! per-lock counters with the library's lock names.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    endpoint::Endpoint,
    error::{AttemptError, PoolError},
    exchange::{Exchange, ExchangeReport},
    locking::{LockRegistry, LockStats},
    pipe::DEFAULT_CAPACITY,
    session::{Session, SessionContext, SessionLibrary},
    stats::ContextStats,
};

/// Upper bound on concurrent workers.
pub const MAX_THREADS: usize = 100;

/// Shape of one stress run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Number of worker threads, 1..=[`MAX_THREADS`]
    pub threads: usize,
    /// Connection attempts per worker, at least 1
    pub iterations: usize,
    /// Keep one session handle per role across a worker's attempts
    pub reuse_sessions: bool,
    /// Capacity of each pipe direction, in bytes
    pub pipe_capacity: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { threads: 10, iterations: 10, reuse_sessions: false, pipe_capacity: DEFAULT_CAPACITY }
    }
}

impl RunConfig {
    /// Configuration for `threads` workers of `iterations` attempts each,
    /// clamped into range.
    pub fn new(threads: usize, iterations: usize) -> Self {
        Self { threads, iterations, ..Self::default() }.clamped()
    }

    /// Bring every field into its valid range.
    ///
    /// Zero threads or iterations become one; more than [`MAX_THREADS`]
    /// threads become [`MAX_THREADS`].
    pub fn clamped(self) -> Self {
        Self {
            threads: self.threads.clamp(1, MAX_THREADS),
            iterations: self.iterations.max(1),
            pipe_capacity: self.pipe_capacity.max(1),
            ..self
        }
    }

    /// Enable or disable session handle reuse.
    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse_sessions = reuse;
        self
    }

    /// Set the capacity of each pipe direction.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// Attempts the run makes if every worker succeeds.
    pub fn total_attempts(&self) -> usize {
        self.threads * self.iterations
    }
}

/// How a worker finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every iteration completed.
    Completed,
    /// An attempt failed; later iterations were skipped.
    Failed {
        /// Zero-based index of the failed iteration
        iteration: usize,
        /// Cause of the failure
        error: AttemptError,
    },
    /// The worker thread panicked.
    Panicked,
}

/// Result of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Worker index
    pub worker: usize,
    /// Thread identifier reported through the locking callback
    pub thread_id: u64,
    /// Attempts that completed
    pub completed: usize,
    /// Final state
    pub outcome: WorkerOutcome,
    /// Library error messages recorded for this worker's thread
    pub errors: Vec<String>,
}

impl WorkerReport {
    /// Whether every iteration completed.
    pub fn is_success(&self) -> bool {
        self.outcome == WorkerOutcome::Completed
    }
}

/// Aggregate result of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Per-worker results in worker order
    pub workers: Vec<WorkerReport>,
    /// Final lock usage counters
    pub locks: LockStats,
    /// Client context statistics at the end of the run
    pub client: ContextStats,
    /// Server context statistics at the end of the run
    pub server: ContextStats,
    /// Wall-clock time from first spawn to last join
    pub elapsed: Duration,
    /// Effective (clamped) configuration
    pub config: RunConfig,
}

impl RunReport {
    /// Whether every worker completed every iteration.
    pub fn is_success(&self) -> bool {
        self.workers.iter().all(WorkerReport::is_success)
    }

    /// Attempts that completed across all workers.
    pub fn completed_attempts(&self) -> usize {
        self.workers.iter().map(|w| w.completed).sum()
    }

    /// Workers that did not complete.
    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerReport> {
        self.workers.iter().filter(|w| !w.is_success())
    }
}

/// A running set of workers driving one library.
pub struct WorkerPool<L: SessionLibrary> {
    library: Arc<L>,
    registry: Arc<LockRegistry>,
    handles: Vec<JoinHandle<WorkerReport>>,
    config: RunConfig,
    started: Instant,
}

impl<L: SessionLibrary> WorkerPool<L> {
    /// Install the lock registry and start every worker.
    ///
    /// # Errors
    ///
    /// - `Install` if the library already has a locking callback
    /// - `Spawn` if a worker thread cannot be created; workers already
    ///   started are joined and the callback is removed first
    pub fn run(library: Arc<L>, config: RunConfig) -> Result<Self, PoolError> {
        let requested = config;
        let config = config.clamped();
        if config != requested {
            warn!(?requested, effective = ?config, "run configuration clamped");
        }

        let registry = Arc::new(LockRegistry::new(library.lock_count()));
        library.hooks().install(registry.clone())?;

        let started = Instant::now();
        let mut handles = Vec::with_capacity(config.threads);
        for worker in 0..config.threads {
            let lib = Arc::clone(&library);
            let spawned = thread::Builder::new()
                .name(format!("mtstress-worker-{worker}"))
                .spawn(move || run_worker(lib.as_ref(), worker, config));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    error!(worker, %source, "cannot spawn worker");
                    for handle in handles {
                        let _ = handle.join();
                    }
                    drop(library.hooks().uninstall());
                    return Err(PoolError::Spawn { worker, source });
                },
            }
        }

        info!(
            threads = config.threads,
            iterations = config.iterations,
            reuse = config.reuse_sessions,
            locks = registry.lock_count(),
            "workers started"
        );

        Ok(Self { library, registry, handles, config, started })
    }

    /// Effective configuration of the run.
    pub fn config(&self) -> RunConfig {
        self.config
    }

    /// Wait for every worker and collect the report.
    pub fn join(self) -> RunReport {
        let Self { library, registry, handles, config, started } = self;

        let workers: Vec<_> = handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle.join().unwrap_or_else(|_| {
                    error!(worker, "worker panicked");
                    WorkerReport {
                        worker,
                        thread_id: 0,
                        completed: 0,
                        outcome: WorkerOutcome::Panicked,
                        errors: Vec::new(),
                    }
                })
            })
            .collect();
        let elapsed = started.elapsed();

        drop(library.hooks().uninstall());

        let snapshot = registry.counters();
        let counts = registry.teardown().unwrap_or_else(|err| {
            warn!(%err, "lock registry teardown failed; reporting last snapshot");
            snapshot
        });
        let locks = LockStats::new(counts, |id| library.lock_name(id));

        let report = RunReport {
            workers,
            locks,
            client: library.client().stats(),
            server: library.server().stats(),
            elapsed,
            config,
        };
        info!(
            completed = report.completed_attempts(),
            expected = config.total_attempts(),
            lock_acquisitions = report.locks.total(),
            elapsed_ms = elapsed.as_millis() as u64,
            "run finished"
        );
        report
    }
}

/// Run `config` to completion on `library`.
pub fn run<L: SessionLibrary>(library: Arc<L>, config: RunConfig) -> Result<RunReport, PoolError> {
    Ok(WorkerPool::run(library, config)?.join())
}

fn run_worker<L: SessionLibrary>(library: &L, worker: usize, config: RunConfig) -> WorkerReport {
    let thread_id = library.hooks().thread_id();
    debug!(worker, thread_id, "worker started");

    let result = if config.reuse_sessions {
        run_reused(library, worker, config)
    } else {
        run_fresh(library, worker, config)
    };

    let (completed, outcome) = match result {
        Ok(()) => (config.iterations, WorkerOutcome::Completed),
        Err((iteration, error)) => {
            warn!(worker, iteration, %error, "attempt failed");
            (iteration, WorkerOutcome::Failed { iteration, error })
        },
    };
    let errors = library.drain_errors();
    for message in &errors {
        debug!(worker, message = %message, "library error");
    }

    debug!(worker, completed, "worker done");
    WorkerReport { worker, thread_id, completed, outcome, errors }
}

fn run_fresh<L: SessionLibrary>(
    library: &L,
    worker: usize,
    config: RunConfig,
) -> Result<(), (usize, AttemptError)> {
    for iteration in 0..config.iterations {
        let attempt = attempt_fresh(library, config.pipe_capacity);
        trace_attempt(worker, iteration, attempt).map_err(|e| (iteration, e))?;
    }
    Ok(())
}

fn run_reused<L: SessionLibrary>(
    library: &L,
    worker: usize,
    config: RunConfig,
) -> Result<(), (usize, AttemptError)> {
    let mut client = allocate(library.client()).map_err(|e| (0, e))?;
    let mut server = allocate(library.server()).map_err(|e| (0, e))?;

    for iteration in 0..config.iterations {
        let attempt = attempt_reused(&mut client, &mut server, config.pipe_capacity);
        trace_attempt(worker, iteration, attempt).map_err(|e| (iteration, e))?;
    }
    Ok(())
}

fn attempt_fresh<L: SessionLibrary>(
    library: &L,
    pipe_capacity: usize,
) -> Result<ExchangeReport, AttemptError> {
    let client = Endpoint::owned(allocate(library.client())?)?;
    let server = Endpoint::owned(allocate(library.server())?)?;
    Ok(Exchange::new(client, server, pipe_capacity)?.run()?)
}

fn attempt_reused<S: Session>(
    client: &mut S,
    server: &mut S,
    pipe_capacity: usize,
) -> Result<ExchangeReport, AttemptError> {
    let client = Endpoint::borrowed(client)?;
    let server = Endpoint::borrowed(server)?;
    Ok(Exchange::new(client, server, pipe_capacity)?.run()?)
}

fn allocate<C: SessionContext>(context: &C) -> Result<C::Session, AttemptError> {
    context
        .new_session()
        .map_err(|source| AttemptError::Allocation { role: context.role(), source })
}

fn trace_attempt(
    worker: usize,
    iteration: usize,
    attempt: Result<ExchangeReport, AttemptError>,
) -> Result<(), AttemptError> {
    let report = attempt?;
    trace!(
        worker,
        iteration,
        rounds = report.rounds,
        client = %report.client_handle,
        server = %report.server_handle,
        "attempt complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ExchangeError, exchange::Phase};

    #[test]
    fn defaults_match_classic_run() {
        let config = RunConfig::default();
        assert_eq!(config.threads, 10);
        assert_eq!(config.iterations, 10);
        assert!(!config.reuse_sessions);
        assert_eq!(config.total_attempts(), 100);
    }

    #[test]
    fn zero_values_clamp_to_one() {
        let config = RunConfig::new(0, 0);
        assert_eq!((config.threads, config.iterations), (1, 1));

        let config = RunConfig::default().with_pipe_capacity(0).clamped();
        assert_eq!(config.pipe_capacity, 1);
    }

    #[test]
    fn thread_count_is_capped() {
        assert_eq!(RunConfig::new(MAX_THREADS + 1, 1).threads, MAX_THREADS);
        assert_eq!(RunConfig::new(MAX_THREADS, 1).threads, MAX_THREADS);
    }

    #[test]
    fn report_counts_failures() {
        let failed = WorkerReport {
            worker: 1,
            thread_id: 9,
            completed: 2,
            outcome: WorkerOutcome::Failed {
                iteration: 2,
                error: AttemptError::Exchange(ExchangeError::StartupDeadlock {
                    rounds: 3,
                    client: Phase::NeedRead,
                    server: Phase::NeedRead,
                }),
            },
            errors: vec!["handshake rejected".into()],
        };
        let ok = WorkerReport {
            worker: 0,
            thread_id: 8,
            completed: 5,
            outcome: WorkerOutcome::Completed,
            errors: Vec::new(),
        };
        let report = RunReport {
            workers: vec![ok, failed],
            locks: LockStats::default(),
            client: ContextStats::default(),
            server: ContextStats::default(),
            elapsed: Duration::ZERO,
            config: RunConfig::new(2, 5),
        };

        assert!(!report.is_success());
        assert_eq!(report.completed_attempts(), 7);
        assert_eq!(report.failed_workers().map(|w| w.worker).collect::<Vec<_>>(), vec![1]);
    }
}
