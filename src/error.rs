//! Error types: the wire-level database error record, per-attempt
//! transaction failures, and driver-level failures that abort a run.

use std::fmt;

use thiserror::Error;

use crate::session::Dialect;

/// A database error as surfaced by a session: vendor error code plus the
/// five-character SQLSTATE, when the driver reported one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub vendor_code: i32,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(vendor_code: i32, sqlstate: Option<&str>, message: &str) -> Self {
        Self {
            vendor_code,
            sqlstate: sqlstate.map(str::to_owned),
            message: message.to_owned(),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(
                f,
                "[{state}] code {code}: {msg}",
                code = self.vendor_code,
                msg = self.message
            ),
            None => write!(f, "code {}: {}", self.vendor_code, self.message),
        }
    }
}

impl std::error::Error for DbError {}

/// Why a single transaction attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TxnError {
    /// The transaction body rolled itself back on purpose, as part of the
    /// workload definition (e.g. the deliberately aborted slice of
    /// NewOrder).
    #[error("transaction aborted by its own logic")]
    UserAbort,

    /// The database rejected the statement or the transaction.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The connection itself is gone: socket reset, driver I/O failure.
    /// Recoverable by reconnecting and re-running the same procedure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The benchmark is winding down; the attempt never reached the
    /// database.
    #[error("benchmark shutting down")]
    Shutdown,
}

/// Unrecoverable failures. Anything of this kind aborts the run before the
/// measurement phase begins and maps to a non-zero process exit in the
/// invoking layer; in-flight database errors never surface here.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not establish the initial {dialect} session: {source}")]
    Bootstrap { dialect: Dialect, source: DbError },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("could not serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),
}
