//! Per-workload coordination: the rate-limited work queue, worker
//! wake/sleep, and phase transitions.
//!
//! The queue itself is a plain `VecDeque` behind a mutex held only for
//! push/pop; waiting and waking run on a token pool
//! (`tokio::sync::Semaphore`) whose permit count tracks the queue length,
//! plus a watch epoch bumped on every phase switch. Counters are atomics;
//! no lock is held across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::{watch, Semaphore, SemaphorePermit};

use crate::phase::{Phase, TransactionType};
use crate::state::{BenchmarkState, State};
use crate::trace::TraceReader;

/// Logical bound of the work queue. When the target rate outruns the
/// database, the oldest entries are dropped first: under overload,
/// freshness wins.
pub const RATE_QUEUE_LIMIT: usize = 10_000;

/// A queued intent to execute one transaction of a given type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedProcedure {
    pub txn: TransactionType,
    pub enqueue_ns: u64,
}

impl SubmittedProcedure {
    pub fn new(txn: TransactionType, enqueue_ns: u64) -> Self {
        Self { txn, enqueue_ns }
    }
}

/// Coordinator shared by every worker of one workload.
pub struct WorkloadState {
    bench: Arc<BenchmarkState>,
    queue: Mutex<VecDeque<SubmittedProcedure>>,
    queue_size: AtomicUsize,
    tokens: Semaphore,
    workers_waiting: AtomicUsize,
    workers_working: AtomicUsize,
    worker_need_sleep: AtomicI64,
    num_terminals: usize,
    phases: Mutex<VecDeque<Arc<Phase>>>,
    current: RwLock<Option<Arc<Phase>>>,
    phase_epoch: watch::Sender<u64>,
    phase_start_ns: AtomicU64,
    trace: Option<Arc<dyn TraceReader>>,
}

impl WorkloadState {
    pub fn new(
        bench: Arc<BenchmarkState>,
        phases: Vec<Arc<Phase>>,
        num_terminals: usize,
        trace: Option<Arc<dyn TraceReader>>,
    ) -> Self {
        let (phase_epoch, _) = watch::channel(0);
        Self {
            bench,
            queue: Mutex::new(VecDeque::new()),
            queue_size: AtomicUsize::new(0),
            tokens: Semaphore::new(0),
            workers_waiting: AtomicUsize::new(0),
            workers_working: AtomicUsize::new(0),
            worker_need_sleep: AtomicI64::new(num_terminals as i64),
            num_terminals,
            phases: Mutex::new(phases.into_iter().collect()),
            current: RwLock::new(None),
            phase_epoch,
            phase_start_ns: AtomicU64::new(0),
            trace,
        }
    }

    pub fn benchmark(&self) -> &Arc<BenchmarkState> {
        &self.bench
    }

    pub fn current_phase(&self) -> Option<Arc<Phase>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    pub fn workers_waiting(&self) -> usize {
        self.workers_waiting.load(Ordering::Relaxed)
    }

    pub fn workers_working(&self) -> usize {
        self.workers_working.load(Ordering::Relaxed)
    }

    pub fn phase_start_ns(&self) -> u64 {
        self.phase_start_ns.load(Ordering::Relaxed)
    }

    pub fn has_trace(&self) -> bool {
        self.trace.is_some()
    }

    fn locked_queue(&self) -> MutexGuard<'_, VecDeque<SubmittedProcedure>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add work to the queue. Called by the rate governor on every tick.
    ///
    /// Disabled, serial and unlimited phases produce no queued work; with
    /// a trace attached the script decides what is due instead of the
    /// mix. After appending, the queue is trimmed from the head down to
    /// [`RATE_QUEUE_LIMIT`] and up to `min(amount, workers waiting)`
    /// waiters are woken through the token pool.
    pub fn add_to_queue(&self, amount: usize, reset_queues: bool) {
        if reset_queues {
            self.drain_queue();
        }

        let phase = self.current_phase();
        let appended = if let Some(trace) = &self.trace {
            if phase.is_none() || self.bench.current() == State::Warmup {
                0
            } else {
                let procedures = trace.procedures_for(self.bench.now_ns());
                let n = procedures.len();
                let mut queue = self.locked_queue();
                for proc in procedures {
                    queue.push_back(proc);
                }
                drop(queue);
                self.queue_size.fetch_add(n, Ordering::Relaxed);
                n
            }
        } else {
            match &phase {
                Some(p) if p.is_rate_limited() => {
                    let now = self.bench.now_ns();
                    let mut rng = rand::thread_rng();
                    let mut queue = self.locked_queue();
                    for _ in 0..amount {
                        queue.push_back(SubmittedProcedure::new(
                            p.choose_transaction(&mut rng),
                            now,
                        ));
                    }
                    drop(queue);
                    self.queue_size.fetch_add(amount, Ordering::Relaxed);
                    amount
                }
                // Disabled, serial and unlimited phases take nothing from
                // the queue.
                _ => return,
            }
        };

        let mut dropped = 0usize;
        {
            let mut queue = self.locked_queue();
            while self.queue_size.load(Ordering::Relaxed) > RATE_QUEUE_LIMIT {
                if queue.pop_front().is_some() {
                    self.queue_size.fetch_sub(1, Ordering::Relaxed);
                    dropped += 1;
                } else {
                    break;
                }
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, "work queue over limit, dropping oldest entries");
        }

        let grant = appended.saturating_sub(dropped);
        if grant > 0 {
            self.tokens.add_permits(grant);
        }
    }

    /// Empty the queue and burn the matching tokens.
    fn drain_queue(&self) -> usize {
        let drained = {
            let mut queue = self.locked_queue();
            let n = queue.len();
            queue.clear();
            n
        };
        self.queue_size.store(0, Ordering::Relaxed);
        let mut reclaimed = 0;
        while reclaimed < drained {
            match self.tokens.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    reclaimed += 1;
                }
                Err(_) => break,
            }
        }
        drained
    }

    /// Pop one procedure against an acquired token. Returns `None` when
    /// the queue was drained behind the token; the token is burned so the
    /// pool converges back onto the queue length.
    fn take(&self, permit: SemaphorePermit<'_>) -> Option<SubmittedProcedure> {
        // Scripted warmup is a peek: the script must not be consumed
        // before measurement starts, so the entry stays and the token
        // goes back.
        if self.trace.is_some() && self.bench.current() == State::Warmup {
            let front = self.locked_queue().front().cloned();
            if front.is_some() {
                drop(permit);
                self.workers_working.fetch_add(1, Ordering::Relaxed);
            } else {
                permit.forget();
            }
            return front;
        }
        match self.locked_queue().pop_front() {
            Some(proc) => {
                self.queue_size.fetch_sub(1, Ordering::Relaxed);
                permit.forget();
                self.workers_working.fetch_add(1, Ordering::Relaxed);
                Some(proc)
            }
            None => {
                permit.forget();
                None
            }
        }
    }

    /// Fetch the next procedure for `worker_id`, blocking until work is
    /// available. `None` means the worker should leave its loop.
    ///
    /// Serial phases hand out their deterministic schedule one entry at a
    /// time; unlimited phases choose straight from the mix without
    /// touching the queue; rate-limited (and scripted) phases consume the
    /// queue. A worker blocked here also wakes on phase transitions and
    /// re-dispatches against the new phase.
    pub async fn fetch_work(&self, worker_id: usize) -> Option<SubmittedProcedure> {
        let mut state_rx = self.bench.subscribe();
        let mut phase_rx = self.phase_epoch.subscribe();
        loop {
            if self.bench.current().is_over() {
                return None;
            }
            let Some(phase) = self.current_phase() else {
                return None;
            };

            if phase.is_serial() {
                if self.bench.current() == State::LatencyComplete {
                    // Between serial passes the terminals idle until the
                    // orchestrator moves on.
                    self.workers_waiting.fetch_add(1, Ordering::Relaxed);
                    while self.bench.current() == State::LatencyComplete {
                        tokio::select! {
                            changed = state_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            changed = phase_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    self.workers_waiting.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
                match phase.next_serial() {
                    Some(txn) => {
                        self.workers_working.fetch_add(1, Ordering::Relaxed);
                        return Some(SubmittedProcedure::new(txn, self.bench.now_ns()));
                    }
                    None => {
                        match self.bench.current() {
                            // The hot pass covered every query: latency
                            // measurement for this phase is complete.
                            State::HotQuery => self.bench.signal_latency_complete(),
                            State::Done | State::Exit => return None,
                            _ => phase.reset_serial(),
                        }
                        continue;
                    }
                }
            }

            if self.trace.is_none() && !phase.is_rate_limited() && !phase.is_disabled() {
                self.workers_working.fetch_add(1, Ordering::Relaxed);
                let mut rng = rand::thread_rng();
                return Some(SubmittedProcedure::new(
                    phase.choose_transaction(&mut rng),
                    self.bench.now_ns(),
                ));
            }

            // Rate-limited, scripted, or disabled: the queue decides.
            if let Ok(permit) = self.tokens.try_acquire() {
                if let Some(proc) = self.take(permit) {
                    return Some(proc);
                }
            }

            self.workers_waiting.fetch_add(1, Ordering::Relaxed);
            let mut redispatch = false;
            let fetched = loop {
                tokio::select! {
                    permit = self.tokens.acquire() => match permit {
                        Ok(permit) => {
                            if let Some(proc) = self.take(permit) {
                                break Some(proc);
                            }
                            if self.bench.current().is_over() {
                                break None;
                            }
                        }
                        // Pool closed: the workload is over.
                        Err(_) => break None,
                    },
                    changed = state_rx.changed() => {
                        if changed.is_err() || self.bench.current().is_over() {
                            break None;
                        }
                    }
                    changed = phase_rx.changed() => {
                        if changed.is_err() {
                            break None;
                        }
                        redispatch = true;
                        break None;
                    }
                }
            };
            self.workers_waiting.fetch_sub(1, Ordering::Relaxed);
            match fetched {
                Some(proc) => return Some(proc),
                None if redispatch => {
                    tracing::trace!(worker_id, "phase switched while waiting, re-dispatching");
                }
                None => return None,
            }
        }
    }

    /// Must be called exactly once per successful fetch.
    pub fn finished_work(&self) {
        let previous = self.workers_working.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "finished_work without a matching fetch");
    }

    /// Advance to the next phase, dropping all work queued for the old
    /// one. Returns the phase now current, or `None` when the schedule is
    /// exhausted. Sets the sleep tickets so that exactly
    /// `active_terminals` workers stay awake, then wakes every waiter.
    pub fn switch_to_next_phase(&self) -> Option<Arc<Phase>> {
        let next = self
            .phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *current = next.clone();
        }
        self.drain_queue();
        self.phase_start_ns
            .store(self.bench.now_ns(), Ordering::Relaxed);

        match &next {
            None => {
                // End of the workload: wake everyone so they can observe
                // it and terminate.
                self.worker_need_sleep.store(0, Ordering::Release);
            }
            Some(phase) => {
                phase.reset_serial();
                let asleep = if phase.is_disabled() {
                    self.num_terminals
                } else {
                    self.num_terminals - phase.active_terminals
                };
                self.worker_need_sleep
                    .store(asleep as i64, Ordering::Release);
                if let Some(trace) = &self.trace {
                    trace.change_phase(phase.id, self.bench.now_ns());
                }
            }
        }
        self.wake_all();
        next
    }

    /// Park surplus terminals. Each phase leaves `num_terminals -
    /// active_terminals` sleep tickets; a worker that claims one blocks
    /// until the next phase switch and then re-checks. Tickets are taken
    /// with a compare-exchange so concurrent arrivals never oversleep.
    pub async fn stay_awake(&self) {
        if self.worker_need_sleep.load(Ordering::Acquire) <= 0 {
            return;
        }
        let mut phase_rx = self.phase_epoch.subscribe();
        loop {
            let tickets = self.worker_need_sleep.load(Ordering::Acquire);
            if tickets <= 0 {
                return;
            }
            if self
                .worker_need_sleep
                .compare_exchange(tickets, tickets - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if phase_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Called by each worker when it has finished all of its duties. The
    /// last one out closes the token pool and wakes every waiter so they
    /// can observe `Done`.
    pub fn signal_done(&self) -> usize {
        let remaining = self.bench.signal_done();
        if remaining == 0 {
            self.tokens.close();
            self.wake_all();
        }
        remaining
    }

    /// Rendezvous before the first transaction. Scripted runs measure
    /// from the first replayed procedure, so the first worker out of the
    /// gate skips warmup.
    pub async fn block_for_start(&self) {
        self.bench.block_for_start().await;
        if self.trace.is_some() {
            self.bench.start_measure();
        }
    }

    /// True when the script has been fully replayed and absorbed.
    pub fn script_phase_complete(&self) -> bool {
        match &self.trace {
            Some(trace) => {
                trace.phase_complete()
                    && self.queue_size.load(Ordering::Relaxed) == 0
                    && self.workers_working.load(Ordering::Relaxed) == 0
            }
            None => false,
        }
    }

    /// Teardown path: close the pool and wake everything.
    pub fn shutdown(&self) {
        self.tokens.close();
        self.wake_all();
    }

    fn wake_all(&self) {
        self.phase_epoch.send_modify(|epoch| *epoch += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Rate, TransactionType};
    use std::time::Duration;
    use tokio::time::timeout;

    fn phase(id: usize, rate: Rate, active: usize) -> Arc<Phase> {
        Arc::new(Phase::new(
            id,
            vec![(TransactionType(0), 1), (TransactionType(1), 1)],
            active,
            rate,
            Duration::from_secs(1),
        ))
    }

    fn workload(phases: Vec<Arc<Phase>>, terminals: usize) -> Arc<WorkloadState> {
        let bench = Arc::new(BenchmarkState::new(terminals));
        Arc::new(WorkloadState::new(bench, phases, terminals, None))
    }

    #[tokio::test]
    async fn rate_limited_queue_roundtrip() {
        let w = workload(vec![phase(1, Rate::Limited { per_second: 10.0 }, 2)], 2);
        w.switch_to_next_phase();
        w.add_to_queue(3, false);
        assert_eq!(w.queue_size(), 3);

        for _ in 0..3 {
            let proc = w.fetch_work(0).await.expect("queued work");
            assert!(proc.txn.0 < 2);
            w.finished_work();
        }
        assert_eq!(w.queue_size(), 0);
        assert_eq!(w.workers_working(), 0);
    }

    #[tokio::test]
    async fn unlimited_phase_bypasses_the_queue() {
        let w = workload(vec![phase(1, Rate::Unlimited, 1)], 1);
        w.switch_to_next_phase();
        let proc = w.fetch_work(0).await.expect("direct work");
        assert!(proc.txn.0 < 2);
        assert_eq!(w.queue_size(), 0);
        assert_eq!(w.workers_working(), 1);
        w.finished_work();
    }

    #[tokio::test]
    async fn disabled_and_serial_phases_enqueue_nothing() {
        let w = workload(
            vec![phase(1, Rate::Disabled, 0), phase(2, Rate::Serial, 1)],
            1,
        );
        w.switch_to_next_phase();
        w.add_to_queue(5, false);
        assert_eq!(w.queue_size(), 0);
        w.switch_to_next_phase();
        w.add_to_queue(5, false);
        assert_eq!(w.queue_size(), 0);
    }

    #[tokio::test]
    async fn overload_drops_the_oldest_entries() {
        let w = workload(vec![phase(1, Rate::Limited { per_second: 1.0 }, 1)], 1);
        w.switch_to_next_phase();
        w.add_to_queue(RATE_QUEUE_LIMIT + 50, false);
        assert_eq!(w.queue_size(), RATE_QUEUE_LIMIT);
    }

    #[tokio::test]
    async fn switch_drains_queue_and_wakes_blocked_workers() {
        let w = workload(
            vec![
                phase(1, Rate::Limited { per_second: 10.0 }, 2),
                phase(2, Rate::Unlimited, 2),
            ],
            2,
        );
        w.switch_to_next_phase();
        w.add_to_queue(3, false);
        // Drain the three queued entries so the next fetches block.
        for _ in 0..3 {
            w.fetch_work(0).await.expect("queued work");
            w.finished_work();
        }

        let a = tokio::spawn({
            let w = Arc::clone(&w);
            async move { w.fetch_work(0).await }
        });
        let b = tokio::spawn({
            let w = Arc::clone(&w);
            async move { w.fetch_work(1).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(w.workers_waiting(), 2);

        w.switch_to_next_phase();
        assert_eq!(w.queue_size(), 0);

        // Both workers re-dispatch against the unlimited phase.
        let got_a = timeout(Duration::from_secs(1), a)
            .await
            .expect("worker a stuck")
            .expect("worker a panicked");
        let got_b = timeout(Duration::from_secs(1), b)
            .await
            .expect("worker b stuck")
            .expect("worker b panicked");
        assert!(got_a.is_some());
        assert!(got_b.is_some());
        w.finished_work();
        w.finished_work();
    }

    #[tokio::test]
    async fn exhausted_schedule_returns_no_work() {
        let w = workload(vec![phase(1, Rate::Unlimited, 1)], 1);
        w.switch_to_next_phase();
        assert!(w.switch_to_next_phase().is_none());
        assert!(w.fetch_work(0).await.is_none());
    }

    #[tokio::test]
    async fn done_wakes_blocked_fetchers() {
        let w = workload(vec![phase(1, Rate::Limited { per_second: 10.0 }, 1)], 1);
        w.switch_to_next_phase();
        let fetcher = tokio::spawn({
            let w = Arc::clone(&w);
            async move { w.fetch_work(0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(w.signal_done(), 0);
        let got = timeout(Duration::from_secs(1), fetcher)
            .await
            .expect("fetcher stuck")
            .expect("fetcher panicked");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn sleep_tickets_park_the_surplus_terminals() {
        let w = workload(
            vec![
                phase(1, Rate::Unlimited, 2),
                phase(2, Rate::Unlimited, 4),
            ],
            4,
        );
        w.switch_to_next_phase();

        let sleepers: Vec<_> = (0..4)
            .map(|_| {
                tokio::spawn({
                    let w = Arc::clone(&w);
                    async move { w.stay_awake().await }
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let done = sleepers
            .iter()
            .filter(|handle| handle.is_finished())
            .count();
        assert_eq!(done, 2, "exactly two terminals should pass");

        // Next phase activates all four.
        w.switch_to_next_phase();
        for handle in sleepers {
            timeout(Duration::from_secs(1), handle)
                .await
                .expect("sleeper stuck")
                .expect("sleeper panicked");
        }
    }

    #[tokio::test]
    async fn serial_phase_hands_out_the_schedule_in_order() {
        let w = workload(vec![phase(1, Rate::Serial, 1)], 1);
        w.switch_to_next_phase();
        let first = w.fetch_work(0).await.expect("serial work");
        let second = w.fetch_work(0).await.expect("serial work");
        assert_eq!(first.txn, TransactionType(0));
        assert_eq!(second.txn, TransactionType(1));
        w.finished_work();
        w.finished_work();
    }
}
