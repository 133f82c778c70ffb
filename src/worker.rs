//! One virtual terminal: pulls work, runs the chosen transaction against
//! its own session, classifies the outcome, retries, and records latency
//! samples.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::classify::{classify, ErrorClass};
use crate::error::TxnError;
use crate::histogram::ConcurrentHistogram;
use crate::phase::TransactionType;
use crate::results::SampleRow;
use crate::session::{ConnectionManager, SessionFactory};
use crate::state::State;
use crate::workload::{SubmittedProcedure, WorkloadState};

/// Attempt cap per procedure: transient conflicts and unknown errors are
/// retried this many times before the sample is counted as an error.
pub const MAX_RETRIES: usize = 10;

/// Upper bound of the jittered backoff between retries, in milliseconds.
const RETRY_JITTER_MS: u64 = 5;

/// How one procedure ended.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    UserAbort,
    /// The procedure instance was dropped; the worker picked fresh work.
    Retry,
    Error,
    /// Never reached the database: the phase moved away or the benchmark
    /// wound down mid-attempt.
    Skipped,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Outcome::Success => "success",
            Outcome::UserAbort => "user_abort",
            Outcome::Retry => "retry",
            Outcome::Error => "error",
            Outcome::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// One measured procedure attempt sequence, start to final outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySample {
    pub worker_id: usize,
    pub txn: TransactionType,
    pub phase_id: usize,
    pub start_ns: u64,
    pub end_ns: u64,
    pub outcome: Outcome,
}

/// Executes transaction bodies. Supplied per benchmark; the engine hands
/// it the managed connection so prepared statements survive across calls
/// and reconnects stay transparent.
#[async_trait]
pub trait TransactionSet<F: SessionFactory>: Send + Sync {
    async fn execute(
        &self,
        txn: TransactionType,
        conn: &mut ConnectionManager<F>,
        rng: &mut SmallRng,
    ) -> Result<(), TxnError>;
}

/// Shared per-workload outcome counters, one histogram per outcome class,
/// keyed by transaction type.
#[derive(Debug, Default)]
pub struct OutcomeLedger {
    pub success: ConcurrentHistogram<TransactionType>,
    pub user_abort: ConcurrentHistogram<TransactionType>,
    pub retry: ConcurrentHistogram<TransactionType>,
    pub error: ConcurrentHistogram<TransactionType>,
    pub skipped: ConcurrentHistogram<TransactionType>,
}

impl OutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome, txn: TransactionType) {
        self.for_outcome(outcome).put(txn);
    }

    pub fn for_outcome(&self, outcome: Outcome) -> &ConcurrentHistogram<TransactionType> {
        match outcome {
            Outcome::Success => &self.success,
            Outcome::UserAbort => &self.user_abort,
            Outcome::Retry => &self.retry,
            Outcome::Error => &self.error,
            Outcome::Skipped => &self.skipped,
        }
    }

    /// Sum of every counter across all outcome classes.
    pub fn total(&self) -> u64 {
        self.success.total()
            + self.user_abort.total()
            + self.retry.total()
            + self.error.total()
            + self.skipped.total()
    }
}

/// Everything a worker hands back when it terminates.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub samples: Vec<LatencySample>,
}

/// One virtual terminal.
pub struct Worker<F: SessionFactory> {
    id: usize,
    workload: Arc<WorkloadState>,
    conn: ConnectionManager<F>,
    txns: Arc<dyn TransactionSet<F>>,
    ledger: Arc<OutcomeLedger>,
    rows: Option<mpsc::Sender<SampleRow>>,
    rng: SmallRng,
    samples: Vec<LatencySample>,
}

impl<F: SessionFactory> Worker<F> {
    pub fn new(
        id: usize,
        workload: Arc<WorkloadState>,
        conn: ConnectionManager<F>,
        txns: Arc<dyn TransactionSet<F>>,
        ledger: Arc<OutcomeLedger>,
        rows: Option<mpsc::Sender<SampleRow>>,
    ) -> Self {
        Self {
            id,
            workload,
            conn,
            txns,
            ledger,
            rows,
            rng: SmallRng::from_entropy(),
            samples: Vec::new(),
        }
    }

    /// Main terminal loop. Runs until the schedule is exhausted or the
    /// orchestrator tears the benchmark down.
    pub async fn run(mut self) -> WorkerReport {
        self.workload.block_for_start().await;
        tracing::debug!(worker = self.id, "terminal started");

        loop {
            self.workload.stay_awake().await;
            if self.workload.benchmark().current().is_over() {
                break;
            }
            let Some(proc) = self.workload.fetch_work(self.id).await else {
                break;
            };

            let phase = self.workload.current_phase();
            let start_ns = self.workload.benchmark().now_ns();
            let outcome = match &phase {
                Some(phase) if !phase.is_disabled() => self.attempt(&proc).await,
                // The phase moved out from under this procedure.
                _ => Outcome::Skipped,
            };
            let end_ns = self.workload.benchmark().now_ns();

            // Work that outlived the whole schedule has no phase to be
            // accounted against.
            if let Some(phase) = &phase {
                self.record(&proc, phase.id, start_ns, end_ns, outcome).await;
            }
            self.workload.finished_work();

            // The first completed statement of a serial phase flips the
            // measurement from the cold pass to the hot one.
            if outcome == Outcome::Success {
                if let Some(phase) = &phase {
                    if phase.is_serial()
                        && self.workload.benchmark().current() == State::ColdQuery
                    {
                        self.workload.benchmark().start_hot_query();
                    }
                }
            }
        }

        let live = self.workload.signal_done();
        tracing::debug!(worker = self.id, live, "terminal finished");
        WorkerReport {
            worker_id: self.id,
            samples: self.samples,
        }
    }

    /// Run one procedure to a final outcome, retrying transient failures.
    async fn attempt(&mut self, proc: &SubmittedProcedure) -> Outcome {
        for _ in 0..MAX_RETRIES {
            match self.txns.execute(proc.txn, &mut self.conn, &mut self.rng).await {
                Ok(()) => return Outcome::Success,
                Err(TxnError::UserAbort) => {
                    self.conn.rollback().await;
                    return Outcome::UserAbort;
                }
                Err(TxnError::Shutdown) => return Outcome::Skipped,
                Err(TxnError::Transport(reason)) => {
                    tracing::debug!(worker = self.id, %reason, "transport failure, reconnecting");
                    self.conn.invalidate();
                    // Same procedure again; the next execute reconnects.
                }
                Err(TxnError::Db(err)) => match classify(&err) {
                    ErrorClass::Retry | ErrorClass::Unknown => {
                        self.conn.rollback().await;
                        self.backoff().await;
                    }
                    ErrorClass::RetryDifferent => {
                        self.conn.rollback().await;
                        return Outcome::Retry;
                    }
                    ErrorClass::UserAbort => return Outcome::UserAbort,
                    ErrorClass::Fatal => {
                        tracing::error!(
                            worker = self.id,
                            %err,
                            "fatal database error, tearing down session"
                        );
                        self.conn.rollback().await;
                        self.conn.invalidate();
                        return Outcome::Error;
                    }
                },
            }
        }
        Outcome::Error
    }

    async fn backoff(&mut self) {
        let jitter = self.rng.gen_range(0..=RETRY_JITTER_MS);
        if jitter > 0 {
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }

    /// Tally the outcome and append the sample. Warmup work runs but is
    /// not measured.
    async fn record(
        &mut self,
        proc: &SubmittedProcedure,
        phase_id: usize,
        start_ns: u64,
        end_ns: u64,
        outcome: Outcome,
    ) {
        if self.workload.benchmark().current() == State::Warmup {
            return;
        }
        self.ledger.record(outcome, proc.txn);
        let sample = LatencySample {
            worker_id: self.id,
            txn: proc.txn,
            phase_id,
            start_ns,
            end_ns,
            outcome,
        };
        if let Some(rows) = &self.rows {
            // The writer shutting down first is harmless near the end of
            // a run.
            let _ = rows.send(SampleRow::from(&sample)).await;
        }
        self.samples.push(sample);
    }
}
