//! Run summaries and the reporters that carry them out of the process.
//!
//! Summaries are pure data: latency statistics and outcome counts per
//! phase, derived from the merged worker samples. Reporters are the I/O
//! boundary.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::phase::{Rate, TransactionType};
use crate::session::Dialect;
use crate::stats::DistributionStatistics;
use crate::worker::Outcome;

/// Counts for one outcome class, broken down by transaction type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeBreakdown {
    pub outcome: Outcome,
    pub counts: Vec<(TransactionType, u64)>,
    pub total: u64,
}

impl OutcomeBreakdown {
    pub fn new(outcome: Outcome, counts: Vec<(TransactionType, u64)>) -> Self {
        let total = counts.iter().map(|(_, n)| n).sum();
        Self {
            outcome,
            counts,
            total,
        }
    }
}

/// Everything measured for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase_id: usize,
    pub rate: Rate,
    /// Wall-clock seconds the phase actually ran.
    pub measured_secs: f64,
    /// Completed transactions (successes and deliberate aborts).
    pub requests: u64,
    pub throughput_per_sec: f64,
    /// Latency distribution over completed transactions, nanoseconds.
    pub latency: DistributionStatistics,
    pub outcomes: Vec<OutcomeBreakdown>,
}

/// The final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub benchmark: String,
    pub dialect: Dialect,
    pub terminals: usize,
    pub phases: Vec<PhaseSummary>,
    /// Run-level outcome totals across all phases.
    pub totals: Vec<OutcomeBreakdown>,
}

impl RunSummary {
    pub fn total_requests(&self) -> u64 {
        self.phases.iter().map(|p| p.requests).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} on {} ({} terminals)",
            self.benchmark, self.dialect, self.terminals
        )?;
        for phase in &self.phases {
            writeln!(
                f,
                "  phase {} ({:?}): {} requests in {:.1}s, {:.1} req/s",
                phase.phase_id,
                phase.rate,
                phase.requests,
                phase.measured_secs,
                phase.throughput_per_sec
            )?;
            writeln!(f, "    latency(ms) {}", phase.latency)?;
            for breakdown in &phase.outcomes {
                if breakdown.total > 0 {
                    writeln!(f, "    {}: {}", breakdown.outcome, breakdown.total)?;
                }
            }
        }
        Ok(())
    }
}

/// Consumes a finished summary: prints it, ships it, stores it.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, summary: &RunSummary) -> Result<(), DriverError>;
}

/// Prints the human-readable summary to stdout.
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), DriverError> {
        println!("{summary}");
        Ok(())
    }
}

/// Writes the summary as pretty-printed JSON.
pub struct JsonFileReporter {
    pub path: PathBuf,
}

#[async_trait]
impl Reporter for JsonFileReporter {
    async fn report(&self, summary: &RunSummary) -> Result<(), DriverError> {
        let rendered = serde_json::to_string_pretty(summary)?;
        tokio::fs::write(&self.path, rendered).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> RunSummary {
        let mut latencies = [100, 200, 300];
        RunSummary {
            benchmark: "tpcc".into(),
            dialect: Dialect::Postgres,
            terminals: 2,
            phases: vec![PhaseSummary {
                phase_id: 1,
                rate: Rate::Limited { per_second: 100.0 },
                measured_secs: 1.0,
                requests: 3,
                throughput_per_sec: 3.0,
                latency: DistributionStatistics::compute(&mut latencies),
                outcomes: vec![OutcomeBreakdown::new(
                    Outcome::Success,
                    vec![(TransactionType(0), 3)],
                )],
            }],
            totals: vec![],
        }
    }

    #[test]
    fn breakdown_totals_its_counts() {
        let b = OutcomeBreakdown::new(
            Outcome::Retry,
            vec![(TransactionType(0), 2), (TransactionType(1), 5)],
        );
        assert_eq!(b.total, 7);
    }

    #[test]
    fn summary_roundtrips_through_json() {
        let original = summary();
        let json = serde_json::to_string(&original).expect("serialize");
        let parsed: RunSummary = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, original);
        assert_eq!(parsed.total_requests(), 3);
    }

    #[tokio::test]
    async fn json_reporter_writes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("summary.json");
        let reporter = JsonFileReporter { path: path.clone() };
        reporter.report(&summary()).await.expect("report");
        let contents = std::fs::read_to_string(&path).expect("read back");
        assert!(contents.contains("\"benchmark\": \"tpcc\""));
    }
}
