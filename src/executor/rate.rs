//! Rate generation: turns a phase's target rate into queued work.
//!
//! The governor ticks on a fixed interval and converts the current
//! phase's requests-per-second into a whole number of procedures per
//! tick, carrying the fractional remainder forward so the long-term
//! average matches the target exactly.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::phase::Rate;
use crate::workload::{WorkloadState, RATE_QUEUE_LIMIT};

/// Procedures to enqueue this tick, given the target rate and the
/// fractional carry from the previous tick. Returns the quota and the new
/// carry.
pub(crate) fn tick_quota(per_second: f64, tick: Duration, carry: f64) -> (usize, f64) {
    let due = per_second * tick.as_secs_f64() + carry;
    let whole = due.floor();
    if whole < 0.0 {
        return (0, 0.0);
    }
    let quota = if whole >= RATE_QUEUE_LIMIT as f64 {
        RATE_QUEUE_LIMIT
    } else {
        whole as usize
    };
    (quota, due - whole)
}

/// Governor task: one per workload. Feeds the work queue while a
/// rate-limited (or scripted) phase is current and stops once the
/// benchmark is over.
pub(crate) async fn rate_governor(workload: Arc<WorkloadState>, tick: Duration) {
    tracing::debug!(?tick, "rate governor started");
    let mut state_rx = workload.benchmark().subscribe();
    let mut carry = 0.0f64;
    let mut last_phase = None;
    let mut next_tick = Instant::now() + tick;

    loop {
        if workload.benchmark().current().is_over() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            changed = state_rx.changed() => {
                if changed.is_err() || workload.benchmark().current().is_over() {
                    break;
                }
                continue;
            }
        }
        next_tick += tick;

        let Some(phase) = workload.current_phase() else {
            continue;
        };
        if last_phase != Some(phase.id) {
            carry = 0.0;
            last_phase = Some(phase.id);
        }
        match phase.rate {
            Rate::Limited { per_second } => {
                let (quota, next_carry) = tick_quota(per_second, tick, carry);
                carry = next_carry;
                if quota > 0 {
                    workload.add_to_queue(quota, false);
                }
            }
            // Scripted runs emit on the script's own schedule; the tick
            // only decides how often we ask.
            _ if workload.has_trace() => workload.add_to_queue(0, false),
            _ => {}
        }
    }
    tracing::debug!("rate governor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(100);

    #[test]
    fn whole_rates_have_no_carry() {
        let mut expected = 1;
        let mut rate = 10.0;
        for _ in 0..5 {
            let (quota, carry) = tick_quota(rate, TICK, 0.0);
            assert_eq!(quota, expected);
            assert_eq!(carry, 0.0);
            rate *= 10.0;
            expected *= 10;
        }
    }

    #[test]
    fn fractional_carry_accumulates() {
        // 12.5 per second over 100ms ticks: 1.25 per tick, so every
        // fourth tick emits two.
        let mut carry = 0.0;
        let expected = [(1, 0.25), (1, 0.5), (1, 0.75), (2, 0.0)];
        for cycle in 0..3 {
            for (quota, next_carry) in expected {
                let (q, c) = tick_quota(12.5, TICK, carry);
                carry = c;
                assert_eq!(q, quota, "cycle {cycle}");
                assert!((c - next_carry).abs() < 1e-9, "cycle {cycle}");
            }
        }
    }

    #[test]
    fn sub_tick_rates_eventually_emit() {
        // 2 per second over 100ms ticks: one procedure every fifth tick.
        let mut carry = 0.0;
        let mut emitted = 0;
        for _ in 0..10 {
            let (q, c) = tick_quota(2.0, TICK, carry);
            carry = c;
            emitted += q;
        }
        assert_eq!(emitted, 2);
    }

    #[test]
    fn negative_rates_emit_nothing() {
        let (quota, carry) = tick_quota(-50.0, TICK, 0.0);
        assert_eq!(quota, 0);
        assert_eq!(carry, 0.0);
    }

    #[test]
    fn absurd_rates_cap_at_the_queue_limit() {
        let (quota, _) = tick_quota(f64::MAX, TICK, 0.0);
        assert_eq!(quota, RATE_QUEUE_LIMIT);
    }
}
