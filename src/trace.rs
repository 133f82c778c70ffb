//! Replaying a recorded workload script instead of generating work from
//! the phase mix.

use crate::workload::SubmittedProcedure;

/// Source of scripted work. Implementations own the script cursor; the
/// engine only asks what is due and whether the current phase's slice has
/// been fully replayed.
pub trait TraceReader: Send + Sync {
    /// Procedures whose scheduled time is at or before `now_ns`, in
    /// script order.
    fn procedures_for(&self, now_ns: u64) -> Vec<SubmittedProcedure>;

    /// True once the script has no more work for the current phase.
    fn phase_complete(&self) -> bool;

    /// The engine switched phases; re-anchor the script clock.
    fn change_phase(&self, phase_id: usize, now_ns: u64);
}
