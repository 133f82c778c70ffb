//! Process-wide benchmark lifecycle.
//!
//! The state lives in a `watch` channel so every component can both read
//! the current value and block on the next change with one primitive.
//! Transitions are monotone: an illegal request is ignored rather than
//! rewinding progress.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Barrier};

/// Global lifecycle tag.
///
/// `ColdQuery`, `HotQuery` and `LatencyComplete` only occur while a serial
/// phase is current; rate and unlimited phases stay in `Measure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Warmup,
    Measure,
    ColdQuery,
    HotQuery,
    LatencyComplete,
    Done,
    Exit,
}

impl State {
    /// True once no further work should be fetched.
    pub fn is_over(self) -> bool {
        matches!(self, State::Done | State::Exit)
    }
}

/// Shared lifecycle coordinator: the state machine, the startup barrier,
/// and the countdown of live workers.
pub struct BenchmarkState {
    state: watch::Sender<State>,
    start_barrier: Barrier,
    live_workers: AtomicUsize,
    started: Instant,
}

impl BenchmarkState {
    /// `workers` terminals plus the orchestrator rendezvous at the startup
    /// barrier.
    pub fn new(workers: usize) -> Self {
        let (state, _) = watch::channel(State::Warmup);
        Self {
            state,
            start_barrier: Barrier::new(workers + 1),
            live_workers: AtomicUsize::new(workers),
            started: Instant::now(),
        }
    }

    pub fn current(&self) -> State {
        *self.state.borrow()
    }

    /// Receiver for blocking on state changes.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Monotonic nanoseconds since the benchmark was constructed. All
    /// timestamps in samples and the queue use this clock.
    pub fn now_ns(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    /// Rendezvous of all terminals and the orchestrator before the first
    /// transaction runs.
    pub async fn block_for_start(&self) {
        self.start_barrier.wait().await;
    }

    /// Enter the measurement phase: ends warmup, and restores `Measure`
    /// when a serial phase hands over to a non-serial one. Calling it
    /// right after construction skips warmup entirely.
    pub fn start_measure(&self) {
        self.advance(State::Measure, |s| {
            matches!(
                s,
                State::Warmup | State::ColdQuery | State::HotQuery | State::LatencyComplete
            )
        });
    }

    /// Serial phase entered: the first pass runs against cold caches.
    pub fn start_cold_query(&self) {
        self.advance(State::ColdQuery, |s| {
            matches!(
                s,
                State::Measure | State::HotQuery | State::LatencyComplete
            )
        });
    }

    /// First serial result landed; subsequent passes are hot.
    pub fn start_hot_query(&self) {
        self.advance(State::HotQuery, |s| matches!(s, State::ColdQuery));
    }

    /// Every serial query has been measured hot at least once.
    pub fn signal_latency_complete(&self) {
        self.advance(State::LatencyComplete, |s| matches!(s, State::HotQuery));
    }

    /// One worker has finished all of its duties. Returns how many are
    /// still live; the last one out moves the benchmark to `Done`.
    pub fn signal_done(&self) -> usize {
        let remaining = self.live_workers.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.advance(State::Done, |s| s != State::Exit);
        }
        remaining
    }

    /// Terminal state, set by the orchestrator during teardown. Always
    /// wins.
    pub fn signal_exit(&self) {
        self.state.send_modify(|s| {
            if *s != State::Exit {
                tracing::debug!(from = ?*s, "benchmark state -> Exit");
                *s = State::Exit;
            }
        });
    }

    fn advance(&self, next: State, allowed_from: impl Fn(State) -> bool) {
        self.state.send_if_modified(|s| {
            if *s != next && allowed_from(*s) {
                tracing::debug!(from = ?*s, to = ?next, "benchmark state");
                *s = next;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_to_measure() {
        let bench = BenchmarkState::new(1);
        assert_eq!(bench.current(), State::Warmup);
        bench.start_measure();
        assert_eq!(bench.current(), State::Measure);
        // Re-entering is a no-op.
        bench.start_measure();
        assert_eq!(bench.current(), State::Measure);
    }

    #[test]
    fn serial_choreography() {
        let bench = BenchmarkState::new(1);
        bench.start_measure();
        bench.start_cold_query();
        assert_eq!(bench.current(), State::ColdQuery);
        bench.start_hot_query();
        assert_eq!(bench.current(), State::HotQuery);
        // A later serial phase restarts the cold pass.
        bench.start_cold_query();
        assert_eq!(bench.current(), State::ColdQuery);
        bench.start_hot_query();
        bench.signal_latency_complete();
        assert_eq!(bench.current(), State::LatencyComplete);
        bench.start_measure();
        assert_eq!(bench.current(), State::Measure);
    }

    #[test]
    fn illegal_transitions_are_ignored() {
        let bench = BenchmarkState::new(1);
        // Hot queries cannot start before a cold pass ran.
        bench.start_hot_query();
        assert_eq!(bench.current(), State::Warmup);
        bench.signal_latency_complete();
        assert_eq!(bench.current(), State::Warmup);
    }

    #[test]
    fn last_worker_out_moves_to_done() {
        let bench = BenchmarkState::new(3);
        assert_eq!(bench.signal_done(), 2);
        assert_eq!(bench.current(), State::Warmup);
        assert_eq!(bench.signal_done(), 1);
        assert_eq!(bench.signal_done(), 0);
        assert_eq!(bench.current(), State::Done);
    }

    #[test]
    fn exit_wins_over_done() {
        let bench = BenchmarkState::new(1);
        bench.signal_exit();
        assert_eq!(bench.current(), State::Exit);
        bench.signal_done();
        assert_eq!(bench.current(), State::Exit);
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let bench = BenchmarkState::new(1);
        let mut rx = bench.subscribe();
        bench.start_measure();
        rx.changed().await.expect("state sender dropped");
        assert_eq!(*rx.borrow(), State::Measure);
    }
}
