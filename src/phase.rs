//! One stage of a benchmark run: a fixed transaction mix, an active
//! terminal count, and a rate policy.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Identifier of a transaction type within the active benchmark's
/// transaction table. The engine never interprets it; transaction bodies
/// are supplied by the benchmark library.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionType(pub usize);

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How work is produced for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Rate {
    /// No work at all; every terminal sleeps through the phase.
    Disabled,
    /// One transaction at a time, following the mix deterministically.
    Serial,
    /// Terminals run back to back as fast as the database allows.
    Unlimited,
    /// A governor feeds the work queue at the target rate.
    Limited { per_second: f64 },
}

/// Immutable description of one benchmark stage. The only interior state
/// is the cursor of the serial schedule, reset on phase entry.
#[derive(Debug)]
pub struct Phase {
    pub id: usize,
    pub mix: Vec<(TransactionType, u32)>,
    pub active_terminals: usize,
    pub rate: Rate,
    pub duration: Duration,
    serial_order: Vec<TransactionType>,
    serial_pos: AtomicUsize,
}

impl Phase {
    pub fn new(
        id: usize,
        mix: Vec<(TransactionType, u32)>,
        active_terminals: usize,
        rate: Rate,
        duration: Duration,
    ) -> Self {
        let serial_order = mix
            .iter()
            .filter(|(_, weight)| *weight > 0)
            .map(|(txn, _)| *txn)
            .collect();
        Self {
            id,
            mix,
            active_terminals,
            rate,
            duration,
            serial_order,
            serial_pos: AtomicUsize::new(0),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.rate, Rate::Disabled)
    }

    pub fn is_serial(&self) -> bool {
        matches!(self.rate, Rate::Serial)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self.rate, Rate::Limited { .. })
    }

    pub fn rate_per_second(&self) -> Option<f64> {
        match self.rate {
            Rate::Limited { per_second } => Some(per_second),
            _ => None,
        }
    }

    /// Pick a transaction type at random, proportionally to the mix
    /// weights. Zero-weight entries are never chosen.
    pub fn choose_transaction<R: Rng>(&self, rng: &mut R) -> TransactionType {
        let total: u64 = self.mix.iter().map(|(_, w)| u64::from(*w)).sum();
        if total == 0 {
            // Validated configs never get here; fall back to the first
            // entry rather than looping forever.
            return self
                .mix
                .first()
                .map(|(txn, _)| *txn)
                .unwrap_or(TransactionType(0));
        }
        let mut roll = rng.gen_range(0..total);
        for (txn, weight) in &self.mix {
            let weight = u64::from(*weight);
            if roll < weight {
                return *txn;
            }
            roll -= weight;
        }
        // Unreachable: roll < total and the weights sum to total.
        self.mix[self.mix.len() - 1].0
    }

    /// Next entry of the deterministic serial schedule, or `None` once the
    /// current cycle is exhausted. Threads share the cursor; each entry is
    /// handed out exactly once per cycle.
    pub fn next_serial(&self) -> Option<TransactionType> {
        let pos = self.serial_pos.fetch_add(1, Ordering::Relaxed);
        self.serial_order.get(pos).copied()
    }

    /// Rewind the serial schedule. Called on phase entry and between
    /// serial passes.
    pub fn reset_serial(&self) {
        self.serial_pos.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "phase {} ({:?}, {} active, {:?})",
            self.id, self.rate, self.active_terminals, self.duration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn mix(weights: &[u32]) -> Vec<(TransactionType, u32)> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| (TransactionType(i), *w))
            .collect()
    }

    #[test]
    fn zero_weight_entries_are_never_chosen() {
        let phase = Phase::new(
            1,
            mix(&[1, 0, 3]),
            4,
            Rate::Unlimited,
            Duration::from_secs(1),
        );
        let mut rng = StdRng::seed_from_u64(11);
        let mut counts = [0usize; 3];
        for _ in 0..10_000 {
            counts[phase.choose_transaction(&mut rng).0] += 1;
        }
        assert_eq!(counts[1], 0);
        assert!(counts[0] > 0);
        // Weight 3 should dominate weight 1 by roughly 3:1.
        assert!(counts[2] > counts[0] * 2, "{counts:?}");
    }

    #[test]
    fn serial_schedule_skips_zero_weights_and_cycles() {
        let phase = Phase::new(
            1,
            mix(&[2, 0, 1]),
            1,
            Rate::Serial,
            Duration::from_secs(1),
        );
        assert_eq!(phase.next_serial(), Some(TransactionType(0)));
        assert_eq!(phase.next_serial(), Some(TransactionType(2)));
        assert_eq!(phase.next_serial(), None);
        assert_eq!(phase.next_serial(), None);

        phase.reset_serial();
        assert_eq!(phase.next_serial(), Some(TransactionType(0)));
    }

    #[test]
    fn rate_predicates() {
        let limited = Phase::new(
            1,
            mix(&[1]),
            1,
            Rate::Limited { per_second: 50.0 },
            Duration::from_secs(1),
        );
        assert!(limited.is_rate_limited());
        assert_eq!(limited.rate_per_second(), Some(50.0));
        assert!(!limited.is_serial());

        let disabled = Phase::new(2, mix(&[1]), 1, Rate::Disabled, Duration::from_secs(1));
        assert!(disabled.is_disabled());
        assert_eq!(disabled.rate_per_second(), None);
    }
}
