//! Maps a database error to the action the worker should take.
//!
//! The mapping is a union of three lookup tables, consulted in a fixed
//! order: SQLSTATEs that always force [`ErrorClass::Fatal`], then exact
//! `(vendor code, SQLSTATE)` pairs, then SQLSTATE-only entries covering
//! engines whose vendor code is zero or varies. The function is pure and
//! total; anything unmatched is [`ErrorClass::Unknown`], which the worker
//! retries up to its attempt cap.

use crate::error::DbError;

/// How a failed attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Re-run the same procedure with the same parameters after a short
    /// jittered backoff.
    Retry,
    /// Drop this procedure instance and pick a fresh one from the phase
    /// mix.
    RetryDifferent,
    /// The transaction body rolled back deliberately; counted apart from
    /// errors.
    UserAbort,
    /// Not retryable. The worker logs it and tears down the session.
    Fatal,
    /// Nothing known about this error; treated as a capped retry.
    Unknown,
}

/// Classify a database error.
///
/// A missing SQLSTATE is treated as retryable: drivers drop the state on
/// some transient failures and the engine's job is to keep measuring.
pub fn classify(err: &DbError) -> ErrorClass {
    let Some(state) = err.sqlstate.as_deref() else {
        return ErrorClass::Retry;
    };
    if is_fatal_state(state) {
        return ErrorClass::Fatal;
    }
    if let Some(class) = exact_lookup(err.vendor_code, state) {
        return class;
    }
    if let Some(class) = state_lookup(state) {
        return class;
    }
    ErrorClass::Unknown
}

/// SQLSTATEs that are never worth retrying: resource exhaustion and
/// internal corruption, seen on PostgreSQL.
fn is_fatal_state(state: &str) -> bool {
    matches!(state, "53200" | "XX000")
}

fn exact_lookup(code: i32, state: &str) -> Option<ErrorClass> {
    let class = match (code, state) {
        // MySQL deadlock and lock wait timeout
        (1213, "40001") => ErrorClass::Retry,
        (1205, "41000") => ErrorClass::Retry,
        // SQL Server deadlock victim
        (1205, "40001") => ErrorClass::Retry,
        // ORA-08177 cannot serialize access
        (8177, "72000") => ErrorClass::Retry,
        // DB2 deadlock or timeout rollback
        (-911, "40001") => ErrorClass::Retry,
        // DB2 query cancelled
        (0, "57014") | (-952, "57014") => ErrorClass::RetryDifferent,
        _ => return None,
    };
    Some(class)
}

/// SQLSTATE-only entries, for engines where the vendor code carries no
/// extra information (PostgreSQL reports zero).
fn state_lookup(state: &str) -> Option<ErrorClass> {
    match state {
        // serialization failure
        "40001" => Some(ErrorClass::Retry),
        // no data: stale cursor, exhausted script
        "02000" => Some(ErrorClass::RetryDifferent),
        _ => None,
    }
}
