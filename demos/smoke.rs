//! Smoke run against an in-memory backend: no database required.
//!
//!     cargo run --example smoke

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::Rng;

use txdrive::{
    ConnectionManager, DbError, Dialect, Driver, DriverConfig, PhaseSpec, Rate, Reporter,
    Session, SessionFactory, SessionOptions, StdoutReporter, TransactionSet, TransactionType,
    TxnError,
};

struct MemSession;

#[async_trait]
impl Session for MemSession {
    async fn configure(&mut self, _options: &SessionOptions) -> Result<(), DbError> {
        Ok(())
    }
    async fn prepare(&mut self, _txn: TransactionType, _sql: &str) -> Result<(), DbError> {
        Ok(())
    }
    async fn rollback(&mut self) -> Result<(), DbError> {
        Ok(())
    }
    async fn close(&mut self) {}
}

struct MemFactory;

#[async_trait]
impl SessionFactory for MemFactory {
    type Session = MemSession;
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
    async fn open(&self) -> Result<MemSession, DbError> {
        Ok(MemSession)
    }
}

/// Sleeps a couple of milliseconds per call and aborts one percent of the
/// time, standing in for a real TPC-C transaction library.
struct FakeTpcc;

#[async_trait]
impl TransactionSet<MemFactory> for FakeTpcc {
    async fn execute(
        &self,
        txn: TransactionType,
        conn: &mut ConnectionManager<MemFactory>,
        rng: &mut SmallRng,
    ) -> Result<(), TxnError> {
        conn.prepare(txn, "SELECT 1").await?;
        tokio::time::sleep(Duration::from_millis(rng.gen_range(1..4))).await;
        if rng.gen::<f64>() < 0.01 {
            return Err(TxnError::UserAbort);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let config = DriverConfig::builder()
        .benchmark("tpcc-smoke")
        .dialect(Dialect::Postgres)
        .url("postgres://localhost:5432/tpcc")
        .terminals(8)
        .warmup(Duration::from_secs(1))
        .phases(vec![
            PhaseSpec {
                weights: vec![45, 43, 4, 4, 4],
                active_terminals: None,
                rate: Rate::Limited { per_second: 300.0 },
                duration: Duration::from_secs(3),
            },
            PhaseSpec {
                weights: vec![45, 43, 4, 4, 4],
                active_terminals: Some(4),
                rate: Rate::Unlimited,
                duration: Duration::from_secs(2),
            },
        ])
        .build();

    let driver = Driver::builder()
        .config(config)
        .factory(Arc::new(MemFactory))
        .transactions(Arc::new(FakeTpcc) as Arc<dyn TransactionSet<MemFactory>>)
        .build();

    let summary = driver.run().await.expect("smoke run failed");
    StdoutReporter.report(&summary).await.expect("report failed");
}
