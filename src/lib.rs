//! txdrive: a multi-DBMS transactional workload driver.
//!
//! txdrive runs TPC-C-style OLTP benchmarks against relational databases:
//! it spins up a population of concurrent virtual terminals, dispatches
//! pre-parameterised transactions under precise rate and phase control,
//! measures per-transaction latency, classifies outcomes, and emits a
//! reproducible results stream.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`DriverConfig`]: the validated description of a run (target
//!   database, terminal count, and the ordered phase schedule).
//! - [`Driver`]: the orchestrator. Spawns one task per terminal plus a
//!   rate governor, walks the phase schedule, and assembles the final
//!   [`RunSummary`].
//! - [`WorkloadState`]: the coordinator every terminal shares: the
//!   rate-limited work queue, worker wake/sleep, and phase transitions.
//! - [`BenchmarkState`]: the global lifecycle state machine.
//! - [`Worker`]: one virtual terminal with its own database session,
//!   retry state machine, and latency buffer.
//! - [`SessionFactory`] / [`Session`] / [`TransactionSet`]: the seams
//!   where benchmark libraries and database drivers plug in.
//! - [`DistributionStatistics`] and [`ConcurrentHistogram`]: the
//!   measurement pipeline the summary is built from.
//!
//! # Design goals
//!
//! - The engine keeps measuring: in-flight database errors are contained
//!   to one terminal and classified, never fatal to the run.
//! - Transaction accounting is at-most-once across retries, reconnects
//!   and phase switches.
//! - Rate shaping is bounded: when the target rate outruns the database,
//!   the oldest queued work is shed first.
//!
//! # Example
//!
//! See `demos/smoke.rs` for a complete run against an in-memory backend.

pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
pub mod histogram;
pub mod phase;
pub mod report;
pub mod results;
pub mod session;
pub mod state;
pub mod stats;
pub mod trace;
pub mod worker;
pub mod workload;

pub use classify::{classify, ErrorClass};
pub use config::{DriverConfig, PhaseSpec};
pub use error::{DbError, DriverError, TxnError};
pub use executor::Driver;
pub use histogram::ConcurrentHistogram;
pub use phase::{Phase, Rate, TransactionType};
pub use report::{
    JsonFileReporter, OutcomeBreakdown, PhaseSummary, Reporter, RunSummary, StdoutReporter,
};
pub use results::{SampleRow, SampleWriter};
pub use session::{
    ConnectionManager, Dialect, IsolationLevel, Session, SessionFactory, SessionOptions,
};
pub use state::{BenchmarkState, State};
pub use stats::DistributionStatistics;
pub use trace::TraceReader;
pub use worker::{
    LatencySample, Outcome, OutcomeLedger, TransactionSet, Worker, MAX_RETRIES,
};
pub use workload::{SubmittedProcedure, WorkloadState, RATE_QUEUE_LIMIT};
