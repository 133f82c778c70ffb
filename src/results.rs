//! Real-time raw sample stream.
//!
//! Workers send one row per completed procedure over a channel; a
//! dedicated task appends them to the sample file as they arrive, so a
//! crashed run still leaves the rows it measured.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::phase::TransactionType;
use crate::worker::{LatencySample, Outcome};

/// One raw result row as appended to the sample file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRow {
    pub worker_id: usize,
    pub txn: TransactionType,
    pub start_ns: u64,
    pub end_ns: u64,
    pub outcome: Outcome,
}

impl SampleRow {
    fn csv_line(&self) -> String {
        format!(
            "{},{},{},{},{}\n",
            self.worker_id, self.txn, self.start_ns, self.end_ns, self.outcome
        )
    }
}

impl From<&LatencySample> for SampleRow {
    fn from(sample: &LatencySample) -> Self {
        Self {
            worker_id: sample.worker_id,
            txn: sample.txn,
            start_ns: sample.start_ns,
            end_ns: sample.end_ns,
            outcome: sample.outcome,
        }
    }
}

const CSV_HEADER: &[u8] = b"worker_id,txn,start_ns,end_ns,outcome\n";

/// Flush cadence: often enough that the file trails the run closely,
/// without a syscall per row.
const FLUSH_EVERY: u64 = 128;

/// Owns the sample file and the channel workers write to.
pub struct SampleWriter {
    tx: mpsc::Sender<SampleRow>,
    handle: JoinHandle<io::Result<u64>>,
}

impl SampleWriter {
    /// Create (truncate) the sample file and start the writer task.
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path).await?;
        let (tx, mut rx) = mpsc::channel::<SampleRow>(1024);
        let handle = tokio::spawn(async move {
            let mut out = BufWriter::new(file);
            out.write_all(CSV_HEADER).await?;
            let mut rows = 0u64;
            while let Some(row) = rx.recv().await {
                out.write_all(row.csv_line().as_bytes()).await?;
                rows += 1;
                if rows % FLUSH_EVERY == 0 {
                    out.flush().await?;
                }
            }
            out.flush().await?;
            Ok(rows)
        });
        Ok(Self { tx, handle })
    }

    /// A handle for one producer.
    pub fn sender(&self) -> mpsc::Sender<SampleRow> {
        self.tx.clone()
    }

    /// Close the stream and wait for the tail to hit the disk. Returns
    /// the number of rows written.
    pub async fn finish(self) -> io::Result<u64> {
        drop(self.tx);
        match self.handle.await {
            Ok(result) => result,
            Err(join_err) => Err(io::Error::other(join_err)),
        }
    }
}
