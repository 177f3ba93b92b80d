//! The single writer of the result store.
//!
//! Records arrive through an `mpsc` channel and are merged into the on-disk
//! store in batches. Every flush re-reads the file, upserts the batch by roll
//! and replaces the file atomically:
//!
//! 1. rename `store` to `store.bak`
//! 2. write the merged store to `store.tmp`
//! 3. rename `store.tmp` to `store`
//!
//! If step 2 or 3 fails the backup is moved back into place.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::record::{ResultRecord, Store};
use crate::{Error, Result, PERSIST_ESCALATE_AFTER};

/// The canonical store path and its backup/temp siblings.
#[derive(Debug, Clone)]
pub struct StoreFile {
    path: PathBuf,
    backup: PathBuf,
    temp: PathBuf,
}

impl StoreFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            backup: sibling(&path, ".bak"),
            temp: sibling(&path, ".tmp"),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Reads the store, falling back to the backup generation.
    ///
    /// The backup is used both when the store is unreadable and when it is
    /// missing: a crash between the two renames of a flush leaves only the
    /// `.bak` file behind. Starting over from scratch means removing both files.
    /// A missing or corrupt store is never fatal: the worst case is an empty one.
    pub async fn load(&self) -> Store {
        match read_records(&self.path).await {
            Ok(Some(records)) => return Store::from_records(records),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Error reading existing results")
            }
        }

        match read_records(&self.backup).await {
            Ok(Some(records)) => {
                tracing::warn!(
                    path = %self.backup.display(),
                    records = records.len(),
                    "Recovered results from backup"
                );
                Store::from_records(records)
            }
            Ok(None) => Store::new(),
            Err(e) => {
                tracing::warn!(path = %self.backup.display(), error = %e, "Error reading backup");
                Store::new()
            }
        }
    }

    /// Re-reads the store, upserts `batch` and writes the result back.
    /// Returns the size of the merged store.
    pub async fn merge(&self, batch: &[ResultRecord]) -> Result<usize> {
        let mut store = self.load().await;
        store.extend(batch.iter().cloned());
        self.replace(&store).await?;
        Ok(store.len())
    }

    /// Atomically swaps the canonical file for `store`, keeping the old one as backup.
    pub async fn replace(&self, store: &Store) -> Result<()> {
        let body = to_pretty_json(store.records())?;

        if fs::try_exists(&self.path).await? {
            fs::rename(&self.path, &self.backup).await.map_err(|e| {
                Error::Persistence(format!(
                    "can't move {} to backup: {e}",
                    self.path.display()
                ))
            })?;
        }

        if let Err(e) = self.write_and_swap(&body).await {
            self.restore_backup().await;
            return Err(Error::Persistence(format!(
                "can't write {}: {e}",
                self.path.display()
            )));
        }
        Ok(())
    }

    async fn write_and_swap(&self, body: &[u8]) -> Result<()> {
        let mut file = fs::File::create(&self.temp).await?;
        file.write_all(body).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.temp, &self.path).await?;
        Ok(())
    }

    /// Best effort, only logged on failure.
    async fn restore_backup(&self) {
        match fs::try_exists(&self.backup).await {
            Ok(true) => {
                if let Err(e) = fs::rename(&self.backup, &self.path).await {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %e,
                        "Error restoring backup"
                    );
                } else {
                    tracing::warn!(path = %self.path.display(), "Restored store from backup");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "Error checking for backup"),
        }
        let _ = fs::remove_file(&self.temp).await;
    }
}

/// `None` when the file doesn't exist.
async fn read_records(path: &Path) -> Result<Option<Vec<ResultRecord>>> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Four space indent, non-ASCII kept as is.
fn to_pretty_json(records: &[ResultRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(records.len() * 256);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    records.serialize(&mut ser)?;
    Ok(buf)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub flushed: usize,
    pub flushes: usize,
    pub failed_flushes: usize,
    /// Records that never made it to disk.
    pub lost: usize,
}

/// Drains `record_rx` into the store until every sender is gone.
///
/// Cancellation alone doesn't stop the sink: workers finish their in-flight
/// request and drop their senders, and whatever they produced is still
/// flushed. The channel reporting `Disconnected` is the signal that nothing
/// else can arrive.
pub async fn run_sink(
    mut record_rx: mpsc::Receiver<ResultRecord>,
    cancel: CancellationToken,
    file: StoreFile,
    idle: Duration,
) -> SinkSummary {
    let mut summary = SinkSummary::default();
    let mut batch: Vec<ResultRecord> = Vec::new();
    let mut consecutive_failures = 0u32;
    let mut drain_logged = false;

    loop {
        let mut disconnected = false;
        loop {
            match record_rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        if batch.is_empty() {
            if disconnected {
                break;
            }
            if cancel.is_cancelled() && !drain_logged {
                tracing::info!("Finishing saving remaining results...");
                drain_logged = true;
            }
            tokio::time::sleep(idle).await;
            continue;
        }

        summary.flushes += 1;
        match file.merge(&batch).await {
            Ok(total) => {
                tracing::info!(saved = batch.len(), total, "Saved results");
                summary.flushed += batch.len();
                batch.clear();
                consecutive_failures = 0;
            }
            Err(e) => {
                summary.failed_flushes += 1;
                consecutive_failures += 1;
                if consecutive_failures >= PERSIST_ESCALATE_AFTER {
                    tracing::error!(
                        error = %e,
                        consecutive_failures,
                        pending = batch.len(),
                        "Error saving results, store is not being updated"
                    );
                } else {
                    tracing::warn!(error = %e, pending = batch.len(), "Error saving results");
                }

                // Keep the batch for the next round unless nothing more is coming
                // and we already gave it a fair number of tries.
                if disconnected && consecutive_failures >= PERSIST_ESCALATE_AFTER {
                    tracing::error!(lost = batch.len(), "Giving up on unsaved results");
                    summary.lost += batch.len();
                    break;
                }
                tokio::time::sleep(idle).await;
            }
        }
    }

    summary
}
