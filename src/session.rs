//! Per-worker database sessions: the collaborator traits the engine
//! drives, and the connection manager that keeps one session alive per
//! terminal across failures.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{DbError, TxnError};
use crate::phase::TransactionType;
use crate::state::State;

/// Target engine family. The engine itself is dialect-agnostic; the tag
/// exists for logging and for collaborators that format statements or
/// connection strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    MySql,
    Postgres,
    Oracle,
    Db2,
    SqlServer,
    Tibero,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Oracle => "oracle",
            Dialect::Db2 => "db2",
            Dialect::SqlServer => "sqlserver",
            Dialect::Tibero => "tibero",
        };
        f.write_str(name)
    }
}

/// Transaction isolation requested for every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

/// Session settings applied on every (re)connect. Autocommit stays off so
/// transaction bodies control their own boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub isolation: IsolationLevel,
    pub autocommit: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            autocommit: false,
        }
    }
}

/// One live database session, owned by exactly one worker.
#[async_trait]
pub trait Session: Send {
    /// Apply isolation and autocommit settings. Runs once per connect.
    async fn configure(&mut self, options: &SessionOptions) -> Result<(), DbError>;

    /// Prepare a named statement for `txn`. The connection manager makes
    /// this idempotent per session; implementations may assume each
    /// `(txn, sql)` pair arrives at most once between reconnects.
    async fn prepare(&mut self, txn: TransactionType, sql: &str) -> Result<(), DbError>;

    /// Roll back whatever the current transaction left open.
    async fn rollback(&mut self) -> Result<(), DbError>;

    async fn close(&mut self);
}

/// Opens sessions against one configured database.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Session;

    fn dialect(&self) -> Dialect;

    async fn open(&self) -> Result<Self::Session, DbError>;
}

/// Reconnect backoff: capped exponential, then a flat one-second ceiling.
const BACKOFF: [Duration; 5] = [
    Duration::from_millis(50),
    Duration::from_millis(100),
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];

/// Keeps one session alive for a worker.
///
/// Opens lazily, reapplies [`SessionOptions`] on every connect, and
/// retries failed connects with capped exponential backoff until either a
/// session comes up or the benchmark is winding down. The prepared
/// statement cache is keyed by transaction type and cleared whenever the
/// session is torn down.
pub struct ConnectionManager<F: SessionFactory> {
    factory: Arc<F>,
    options: SessionOptions,
    session: Option<F::Session>,
    prepared: HashSet<TransactionType>,
    generation: u64,
    shutdown: watch::Receiver<State>,
}

impl<F: SessionFactory> ConnectionManager<F> {
    pub fn new(
        factory: Arc<F>,
        options: SessionOptions,
        shutdown: watch::Receiver<State>,
    ) -> Self {
        Self {
            factory,
            options,
            session: None,
            prepared: HashSet::new(),
            generation: 0,
            shutdown,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.factory.dialect()
    }

    /// How many times a session has been established. Bumps on every
    /// reconnect; collaborators can use it to notice invalidated state.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// The current session, connecting first if necessary.
    pub async fn session(&mut self) -> Result<&mut F::Session, TxnError> {
        if self.session.is_none() {
            self.reconnect().await?;
        }
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(TxnError::Shutdown),
        }
    }

    /// Prepare `sql` for `txn` once per session.
    pub async fn prepare(&mut self, txn: TransactionType, sql: &str) -> Result<(), TxnError> {
        if self.prepared.contains(&txn) {
            return Ok(());
        }
        self.session().await?.prepare(txn, sql).await?;
        self.prepared.insert(txn);
        Ok(())
    }

    /// Best-effort rollback on the live session, if any. Never
    /// reconnects; a torn-down session has nothing to roll back.
    pub async fn rollback(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if let Err(err) = session.rollback().await {
                tracing::debug!(%err, "rollback failed");
            }
        }
    }

    /// Tear the session down; the next [`session`](Self::session) call
    /// reconnects. Also discards the prepared statement cache.
    pub fn invalidate(&mut self) {
        self.session = None;
        self.prepared.clear();
    }

    async fn reconnect(&mut self) -> Result<(), TxnError> {
        if let Some(mut old) = self.session.take() {
            old.close().await;
        }
        self.prepared.clear();

        let mut attempt = 0usize;
        loop {
            if self.shutdown.borrow().is_over() {
                return Err(TxnError::Shutdown);
            }
            match self.factory.open().await {
                Ok(mut session) => match session.configure(&self.options).await {
                    Ok(()) => {
                        self.generation += 1;
                        self.session = Some(session);
                        if attempt > 0 {
                            tracing::info!(
                                dialect = %self.factory.dialect(),
                                attempts = attempt + 1,
                                "session re-established"
                            );
                        }
                        return Ok(());
                    }
                    Err(err) => {
                        tracing::warn!(
                            %err,
                            dialect = %self.factory.dialect(),
                            "session configuration failed"
                        );
                        session.close().await;
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        %err,
                        dialect = %self.factory.dialect(),
                        attempt,
                        "connect failed"
                    );
                }
            }
            let backoff = BACKOFF[attempt.min(BACKOFF.len() - 1)];
            attempt += 1;
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FlakyFactory {
        opens: AtomicUsize,
        fail_first: usize,
        prepared: Arc<Mutex<Vec<TransactionType>>>,
    }

    #[derive(Debug)]
    struct TestSession {
        prepared: Arc<Mutex<Vec<TransactionType>>>,
        configured: bool,
    }

    #[async_trait]
    impl Session for TestSession {
        async fn configure(&mut self, _options: &SessionOptions) -> Result<(), DbError> {
            self.configured = true;
            Ok(())
        }

        async fn prepare(&mut self, txn: TransactionType, _sql: &str) -> Result<(), DbError> {
            self.prepared
                .lock()
                .expect("prepared log poisoned")
                .push(txn);
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), DbError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl SessionFactory for FlakyFactory {
        type Session = TestSession;

        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        async fn open(&self) -> Result<TestSession, DbError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(DbError::new(0, None, "connection refused"))
            } else {
                Ok(TestSession {
                    prepared: Arc::clone(&self.prepared),
                    configured: false,
                })
            }
        }
    }

    fn shutdown_channel(state: State) -> watch::Receiver<State> {
        let (tx, rx) = watch::channel(state);
        // Keep the sender alive for the duration of the test.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn connects_lazily_and_survives_failures() {
        let factory = Arc::new(FlakyFactory {
            fail_first: 2,
            ..Default::default()
        });
        let mut conn =
            ConnectionManager::new(Arc::clone(&factory), SessionOptions::default(), shutdown_channel(State::Measure));
        assert!(!conn.is_connected());

        let session = conn.session().await.expect("session after retries");
        assert!(session.configured);
        assert!(conn.is_connected());
        assert_eq!(conn.generation(), 1);
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn prepare_is_idempotent_until_invalidated() {
        let factory = Arc::new(FlakyFactory::default());
        let mut conn =
            ConnectionManager::new(Arc::clone(&factory), SessionOptions::default(), shutdown_channel(State::Measure));

        conn.prepare(TransactionType(3), "SELECT 1").await.expect("prepare");
        conn.prepare(TransactionType(3), "SELECT 1").await.expect("prepare");
        assert_eq!(factory.prepared.lock().expect("log").len(), 1);

        conn.invalidate();
        assert!(!conn.is_connected());
        conn.prepare(TransactionType(3), "SELECT 1").await.expect("prepare");
        assert_eq!(factory.prepared.lock().expect("log").len(), 2);
        assert_eq!(conn.generation(), 2);
    }

    #[tokio::test]
    async fn shutdown_aborts_the_reconnect_loop() {
        let factory = Arc::new(FlakyFactory {
            fail_first: usize::MAX,
            ..Default::default()
        });
        let mut conn =
            ConnectionManager::new(factory, SessionOptions::default(), shutdown_channel(State::Exit));
        let err = conn.session().await.expect_err("must refuse to connect");
        assert_eq!(err, TxnError::Shutdown);
    }
}
