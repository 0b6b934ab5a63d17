use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::BufReader;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::message::{read_frame, write_frame, LogEntry, NodeId, TransactionState, TxId};

/// Result of scanning the write-ahead log during recovery.
#[derive(Debug)]
pub struct WalScan {
    /// Last fully decodable entry, if the log holds any.
    pub last_entry: Option<LogEntry>,
    /// Set when the scan stopped at a partial or undecodable trailing record.
    pub corrupt_tail: bool,
}

/// Durable store for one node: an append-only write-ahead log plus a
/// snapshot of the last checkpointed register value.
///
/// Appends go through a single writer handle and are fsynced before the call
/// returns. Queries open their own read handle over the same file, so they
/// are safe to run while another task is appending; at worst they observe a
/// half-written tail record and stop there.
#[derive(Debug)]
pub struct StableStore {
    wal_path: PathBuf,
    snap_path: PathBuf,
    snap_tmp_path: PathBuf,
    writer: Mutex<File>,
}

impl StableStore {
    /// Opens (creating if needed) `<dir>/node_<id>.wal` and the snapshot
    /// directory `<dir>/snaps/`.
    pub async fn open(dir: impl AsRef<Path>, node_id: NodeId) -> Result<Self> {
        let dir = dir.as_ref();
        let snaps_dir = dir.join("snaps");
        fs::create_dir_all(&snaps_dir).await?;

        let wal_path = dir.join(format!("node_{node_id}.wal"));
        let snap_path = snaps_dir.join(format!("node_{node_id}.snap"));
        let snap_tmp_path = snaps_dir.join(format!("node_{node_id}.snap.tmp"));

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)
            .await?;

        Ok(Self {
            wal_path,
            snap_path,
            snap_tmp_path,
            writer: Mutex::new(writer),
        })
    }

    pub async fn write_prepared(&self, tx_id: TxId, value: i64, sender_id: NodeId) -> Result<()> {
        self.append(LogEntry {
            tx_id,
            state: TransactionState::Prepared,
            sender_id,
            value,
        })
        .await
    }

    pub async fn write_committed(&self, tx_id: TxId, value: i64, sender_id: NodeId) -> Result<()> {
        self.append(LogEntry {
            tx_id,
            state: TransactionState::Committed,
            sender_id,
            value,
        })
        .await
    }

    pub async fn write_aborted(&self, tx_id: TxId, sender_id: NodeId) -> Result<()> {
        self.append(LogEntry {
            tx_id,
            state: TransactionState::Aborted,
            sender_id,
            value: 0,
        })
        .await
    }

    async fn append(&self, entry: LogEntry) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &entry).await?;
        // The record must be on disk before the caller acknowledges anything.
        writer.sync_all().await?;
        Ok(())
    }

    /// Scans the log from the start and returns the last decodable entry.
    ///
    /// A decode failure or short read mid-stream means the process died while
    /// appending; everything before the damaged record is still valid, so the
    /// scan reports what it found instead of failing recovery.
    pub async fn recover_last_entry(&self) -> Result<WalScan> {
        let mut reader = BufReader::new(File::open(&self.wal_path).await?);
        let mut last_entry = None;

        loop {
            match read_frame::<_, LogEntry>(&mut reader).await {
                Ok(Some(entry)) => last_entry = Some(entry),
                Ok(None) => {
                    return Ok(WalScan {
                        last_entry,
                        corrupt_tail: false,
                    })
                }
                Err(_) => {
                    return Ok(WalScan {
                        last_entry,
                        corrupt_tail: true,
                    })
                }
            }
        }
    }

    /// Looks up the recorded outcome of `tx_id`.
    ///
    /// Presumed abort: only an explicit `Committed` record counts; anything
    /// else, including no record at all, reads as `Aborted`.
    pub async fn transaction_state(&self, tx_id: TxId) -> Result<TransactionState> {
        let mut reader = BufReader::new(File::open(&self.wal_path).await?);

        loop {
            match read_frame::<_, LogEntry>(&mut reader).await {
                Ok(Some(entry)) => {
                    if entry.tx_id == tx_id && entry.state == TransactionState::Committed {
                        return Ok(TransactionState::Committed);
                    }
                }
                // A damaged tail ends the scan the same way EOF does.
                Ok(None) | Err(_) => return Ok(TransactionState::Aborted),
            }
        }
    }

    /// Checkpoints the committed register value.
    ///
    /// Written to a temp file and renamed into place so a crash mid-write
    /// leaves the previous snapshot intact.
    pub async fn save_snapshot(&self, state: i64) -> Result<()> {
        fs::write(&self.snap_tmp_path, bincode::serialize(&state)?).await?;
        fs::rename(&self.snap_tmp_path, &self.snap_path).await?;
        Ok(())
    }

    /// Loads the checkpointed register value; a node that never snapshotted
    /// starts from zero.
    pub async fn load_snapshot(&self) -> Result<i64> {
        match fs::read(&self.snap_path).await {
            Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Resets the log to empty once a snapshot has superseded it.
    pub async fn truncate(&self) -> Result<()> {
        let writer = self.writer.lock().await;
        writer.set_len(0).await?;
        Ok(())
    }
}
