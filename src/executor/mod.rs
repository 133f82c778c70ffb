//! Orchestration: builds the shared coordinators, spawns the terminals
//! and the rate governor, walks the phase schedule, and assembles the
//! final summary.

mod rate;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::config::DriverConfig;
use crate::error::DriverError;
use crate::phase::{Phase, TransactionType};
use crate::report::{OutcomeBreakdown, PhaseSummary, RunSummary};
use crate::results::SampleWriter;
use crate::session::{ConnectionManager, Session, SessionFactory, SessionOptions};
use crate::state::BenchmarkState;
use crate::stats::DistributionStatistics;
use crate::trace::TraceReader;
use crate::worker::{
    LatencySample, Outcome, OutcomeLedger, TransactionSet, Worker, WorkerReport,
};
use crate::workload::WorkloadState;

use rate::rate_governor;

/// Builds and runs one benchmark workload end to end.
///
/// The driver owns the phase schedule and the global lifecycle; workers
/// and the governor only ever see the shared [`WorkloadState`].
#[derive(TypedBuilder)]
pub struct Driver<F: SessionFactory> {
    config: DriverConfig,
    factory: Arc<F>,
    transactions: Arc<dyn TransactionSet<F>>,
    #[builder(default)]
    trace: Option<Arc<dyn TraceReader>>,
}

impl<F: SessionFactory> Driver<F> {
    /// Run the configured workload to completion.
    ///
    /// Fails fast on configuration errors and on an unreachable database;
    /// once measurement starts, database errors are contained to the
    /// workers and the run always produces a summary.
    pub async fn run(&self) -> Result<RunSummary, DriverError> {
        self.config.validate()?;
        let phases = self.config.build_phases();

        // Probe one session up front so a dead target aborts the run
        // before any terminal starts.
        let mut probe = self.factory.open().await.map_err(|source| {
            DriverError::Bootstrap {
                dialect: self.factory.dialect(),
                source,
            }
        })?;
        probe.close().await;

        let terminals = self.config.terminals;
        let bench = Arc::new(BenchmarkState::new(terminals));
        let workload = Arc::new(WorkloadState::new(
            Arc::clone(&bench),
            phases.clone(),
            terminals,
            self.trace.clone(),
        ));

        let writer = match &self.config.sample_path {
            Some(path) => Some(SampleWriter::create(path).await?),
            None => None,
        };
        let ledger = Arc::new(OutcomeLedger::new());

        tracing::info!(
            benchmark = %self.config.benchmark,
            dialect = %self.config.dialect,
            terminals,
            phases = phases.len(),
            "spawning terminals"
        );
        let options = SessionOptions {
            isolation: self.config.isolation,
            autocommit: false,
        };
        let handles: Vec<_> = (0..terminals)
            .map(|id| {
                let conn = ConnectionManager::new(
                    Arc::clone(&self.factory),
                    options,
                    bench.subscribe(),
                );
                let worker = Worker::new(
                    id,
                    Arc::clone(&workload),
                    conn,
                    Arc::clone(&self.transactions),
                    Arc::clone(&ledger),
                    writer.as_ref().map(|w| w.sender()),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let governor = tokio::spawn(rate_governor(Arc::clone(&workload), self.config.tick));

        // Enter the first phase before releasing the terminals, then walk
        // the schedule.
        let mut current = workload.switch_to_next_phase();
        bench.block_for_start().await;

        if !self.config.warmup.is_zero() && self.trace.is_none() {
            tracing::info!(warmup = ?self.config.warmup, "warming up");
            tokio::time::sleep(self.config.warmup).await;
        }
        bench.start_measure();

        let mut spans: BTreeMap<usize, f64> = BTreeMap::new();
        while let Some(phase) = current {
            tracing::info!(%phase, "phase started");
            if phase.is_serial() {
                bench.start_cold_query();
            } else {
                bench.start_measure();
            }
            let began = Instant::now();
            if self.trace.is_some() {
                // A scripted phase ends when the script for it has been
                // replayed and absorbed, not on the clock.
                while !workload.script_phase_complete() {
                    tokio::time::sleep(self.config.tick).await;
                }
            } else {
                tokio::time::sleep(phase.duration).await;
            }
            spans.insert(phase.id, began.elapsed().as_secs_f64());
            tracing::info!(phase = phase.id, "phase complete");
            current = workload.switch_to_next_phase();
        }

        tracing::info!("schedule exhausted, collecting terminals");
        let reports = join_all(handles).await;
        bench.signal_exit();
        workload.shutdown();
        let _ = governor.await;

        let mut worker_reports = Vec::with_capacity(terminals);
        for report in reports {
            match report {
                Ok(report) => worker_reports.push(report),
                Err(err) => {
                    // Keep what the other terminals measured.
                    tracing::error!(%err, "terminal panicked, its samples are lost");
                }
            }
        }

        if let Some(writer) = writer {
            let rows = writer.finish().await?;
            tracing::info!(rows, "sample stream closed");
        }

        Ok(self.summarize(&phases, worker_reports, &ledger, &spans))
    }

    fn summarize(
        &self,
        phases: &[Arc<Phase>],
        reports: Vec<WorkerReport>,
        ledger: &OutcomeLedger,
        spans: &BTreeMap<usize, f64>,
    ) -> RunSummary {
        let samples: Vec<LatencySample> = reports
            .into_iter()
            .flat_map(|report| report.samples)
            .collect();

        let phase_summaries = phases
            .iter()
            .map(|phase| {
                let in_phase: Vec<&LatencySample> = samples
                    .iter()
                    .filter(|s| s.phase_id == phase.id)
                    .collect();

                // Latency is measured over completed transactions only;
                // retries, errors and skips have no meaningful span.
                let mut latencies: Vec<i32> = in_phase
                    .iter()
                    .filter(|s| {
                        matches!(s.outcome, Outcome::Success | Outcome::UserAbort)
                    })
                    .map(|s| {
                        (s.end_ns - s.start_ns).min(i32::MAX as u64) as i32
                    })
                    .collect();
                let requests = latencies.len() as u64;
                let latency = DistributionStatistics::compute(&mut latencies);

                let measured_secs = spans.get(&phase.id).copied().unwrap_or(0.0);
                let throughput_per_sec = if measured_secs > 0.0 {
                    requests as f64 / measured_secs
                } else {
                    0.0
                };

                let outcomes = outcome_breakdowns(&in_phase);

                PhaseSummary {
                    phase_id: phase.id,
                    rate: phase.rate,
                    measured_secs,
                    requests,
                    throughput_per_sec,
                    latency,
                    outcomes,
                }
            })
            .collect();

        let totals = [
            Outcome::Success,
            Outcome::UserAbort,
            Outcome::Retry,
            Outcome::Error,
            Outcome::Skipped,
        ]
        .into_iter()
        .map(|outcome| {
            let snapshot = ledger.for_outcome(outcome).snapshot();
            OutcomeBreakdown::new(outcome, snapshot.into_iter().collect())
        })
        .collect();

        RunSummary {
            benchmark: self.config.benchmark.clone(),
            dialect: self.config.dialect,
            terminals: self.config.terminals,
            phases: phase_summaries,
            totals,
        }
    }
}

/// Per-outcome, per-transaction counts for one phase's samples.
fn outcome_breakdowns(samples: &[&LatencySample]) -> Vec<OutcomeBreakdown> {
    [
        Outcome::Success,
        Outcome::UserAbort,
        Outcome::Retry,
        Outcome::Error,
        Outcome::Skipped,
    ]
    .into_iter()
    .map(|outcome| {
        let mut counts: BTreeMap<TransactionType, u64> = BTreeMap::new();
        for sample in samples.iter().filter(|s| s.outcome == outcome) {
            *counts.entry(sample.txn).or_default() += 1;
        }
        OutcomeBreakdown::new(outcome, counts.into_iter().collect())
    })
    .collect()
}
