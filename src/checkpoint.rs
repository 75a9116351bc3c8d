use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::merge::ResultTable;
use crate::table::Table;

const FINAL_WRITE_ATTEMPTS: u32 = 3;
const FINAL_WRITE_DELAY: Duration = Duration::from_millis(100);

/// When to snapshot: every `every` completions, and additionally whenever
/// `interval` has passed since the last snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSchedule {
    pub every: u64,
    pub interval: Option<Duration>,
}

/// Where the final write landed and how the periodic writes went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub path: PathBuf,
    pub written: usize,
    pub failed: usize,
}

/// Persists snapshots of the result table. Periodic snapshots are written
/// by a background thread so merging only pays for the copy.
pub struct CheckpointWriter {
    path: PathBuf,
    schedule: CheckpointSchedule,
    last_write: Instant,
    /// A trigger fired while the queue was full.
    due: bool,
    written: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    tx: Option<SyncSender<Table>>,
    worker: Option<JoinHandle<()>>,
}

impl CheckpointWriter {
    pub fn start(path: &Path, schedule: CheckpointSchedule) -> Result<Self> {
        // One snapshot queued while another is being written
        let (tx, rx) = mpsc::sync_channel::<Table>(1);
        let written = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let worker = {
            let path = path.to_path_buf();
            let written = Arc::clone(&written);
            let failed = Arc::clone(&failed);
            std::thread::Builder::new()
                .name("checkpoint".into())
                .spawn(move || {
                    for snapshot in rx {
                        match write_atomic(&path, &snapshot) {
                            Ok(()) => {
                                written.fetch_add(1, Ordering::SeqCst);
                                debug!(path = ?path, rows = snapshot.len(), "checkpoint written");
                            }
                            Err(e) => {
                                failed.fetch_add(1, Ordering::SeqCst);
                                warn!(path = ?path, "checkpoint failed, continuing: {:#}", e);
                            }
                        }
                    }
                })
                .context("Failed to spawn checkpoint thread")?
        };

        Ok(CheckpointWriter {
            path: path.to_path_buf(),
            schedule,
            last_write: Instant::now(),
            due: false,
            written,
            failed,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queue a snapshot if `completed` hits the cadence or the interval has
    /// elapsed. Never blocks: if the writer is still busy the snapshot is
    /// deferred to the next completion. Returns whether a snapshot was queued.
    pub fn maybe_checkpoint(&mut self, completed: u64, table: &ResultTable) -> bool {
        let every = self.schedule.every.max(1);
        let by_count = completed > 0 && completed % every == 0;
        let by_time = self
            .schedule
            .interval
            .is_some_and(|i| self.last_write.elapsed() >= i);
        if !(self.due || by_count || by_time) {
            return false;
        }

        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(table.snapshot()) {
            Ok(()) => {
                self.due = false;
                self.last_write = Instant::now();
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!(completed, "checkpoint writer busy, deferring snapshot");
                self.due = true;
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("checkpoint thread gone, snapshot dropped");
                false
            }
        }
    }

    /// Drain queued snapshots, then write `table` unconditionally. A failing
    /// target is retried, then replaced by `<stem>.recovered.csv`.
    pub fn finish(mut self, table: &Table) -> Result<CheckpointSummary> {
        self.drain();

        let mut last_err = None;
        for attempt in 1..=FINAL_WRITE_ATTEMPTS {
            match write_atomic(&self.path, table) {
                Ok(()) => {
                    return Ok(self.summary(self.path.clone()));
                }
                Err(e) => {
                    warn!(attempt, path = ?self.path, "final write failed: {:#}", e);
                    last_err = Some(e);
                    if attempt < FINAL_WRITE_ATTEMPTS {
                        std::thread::sleep(FINAL_WRITE_DELAY);
                    }
                }
            }
        }

        let alternate = recovery_path(&self.path);
        info!(path = ?alternate, "writing results to recovery path");
        match write_atomic(&alternate, table) {
            Ok(()) => Ok(self.summary(alternate)),
            Err(e) => Err(anyhow!(
                "could not write {:?} ({:#}) nor {:?} ({:#})",
                self.path,
                last_err.unwrap_or_else(|| anyhow!("unknown error")),
                alternate,
                e
            )),
        }
    }

    fn summary(&self, path: PathBuf) -> CheckpointSummary {
        CheckpointSummary {
            path,
            written: self.written.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    fn drain(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("checkpoint thread panicked");
            }
        }
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        self.drain();
    }
}

/// Write to a sibling temp file, then rename over the target.
pub fn write_atomic(path: &Path, table: &Table) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    table.write_csv(&tmp)?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {:?} to {:?}", tmp, path))?;
    Ok(())
}

pub fn recovery_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!("{}.recovered.csv", stem))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::price::Price;
    use crate::enrich::EnrichmentResult;
    use crate::merge::RowStatus;

    fn result_table(n: usize) -> ResultTable {
        let rows = (0..n).map(|i| vec![i.to_string(), format!("${}", i)]).collect();
        let table = Table::new(vec!["ID".into(), "Price".into()], rows);
        ResultTable::prepare(table, "price_status", |_| Price::unknown())
    }

    fn statuses(path: &Path) -> Vec<String> {
        let t = Table::read_csv(path).unwrap();
        let col = t.column("price_status").unwrap();
        t.rows().iter().map(|r| r[col].clone()).collect()
    }

    fn every(k: u64) -> CheckpointSchedule {
        CheckpointSchedule {
            every: k,
            interval: None,
        }
    }

    /// Wait until the background thread has written `n` snapshots.
    fn settle(writer: &CheckpointWriter, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while writer.written.load(Ordering::SeqCst) < n && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn interrupted_run_loses_less_than_k() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut rt = result_table(10);
        let mut writer = CheckpointWriter::start(&path, every(3)).unwrap();

        let mut queued = 0;
        for i in 0..8 {
            rt.apply(i, &EnrichmentResult::Success(Price::new(i as f64, "USD")));
            if writer.maybe_checkpoint(i as u64 + 1, &rt) {
                queued += 1;
                settle(&writer, queued);
            }
        }
        // Crash: no final write, only queued snapshots are flushed
        drop(writer);

        assert_eq!(queued, 2);
        let done = statuses(&path).iter().filter(|s| *s == "ok").count();
        assert_eq!(done, 6);
        assert!(8 - done < 3);
    }

    #[test]
    fn final_write_is_unconditional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut rt = result_table(4);
        let mut writer = CheckpointWriter::start(&path, every(100)).unwrap();
        for i in 0..4 {
            rt.apply(i, &EnrichmentResult::Failure(Price::unknown()));
            assert!(!writer.maybe_checkpoint(i as u64 + 1, &rt));
        }
        let summary = writer.finish(&rt.snapshot()).unwrap();

        assert_eq!(summary.path, path);
        assert_eq!(summary.written, 0);
        assert_eq!(statuses(&path), vec!["fallback"; 4]);
        assert!(!dir.path().join("out.csv.tmp").exists());
    }

    #[test]
    fn overwrites_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "stale,content\n1,2\n3,4\n5,6\n7,8\n9,10\n").unwrap();
        let rt = result_table(2);
        let writer = CheckpointWriter::start(&path, every(1)).unwrap();
        writer.finish(&rt.snapshot()).unwrap();

        let t = Table::read_csv(&path).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.headers()[0], "ID");
    }

    #[test]
    fn unwritable_target_falls_back_to_recovery_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        // A directory cannot be replaced by the renamed temp file
        std::fs::create_dir(&path).unwrap();

        let mut rt = result_table(2);
        let mut writer = CheckpointWriter::start(&path, every(1)).unwrap();
        rt.apply(0, &EnrichmentResult::Success(Price::new(1.0, "USD")));
        assert!(writer.maybe_checkpoint(1, &rt));
        let summary = writer.finish(&rt.snapshot()).unwrap();

        assert_eq!(summary.path, dir.path().join("out.recovered.csv"));
        assert_eq!(summary.failed, 1);
        assert_eq!(statuses(&summary.path), vec!["ok", "pending"]);
        assert_eq!(rt.status(0), Some(RowStatus::Ok));
    }

    #[test]
    fn time_based_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let rt = result_table(1);
        let mut writer = CheckpointWriter::start(
            &path,
            CheckpointSchedule {
                every: 1000,
                interval: Some(Duration::from_millis(20)),
            },
        )
        .unwrap();
        assert!(!writer.maybe_checkpoint(1, &rt));
        std::thread::sleep(Duration::from_millis(30));
        assert!(writer.maybe_checkpoint(2, &rt));
        drop(writer);
        assert!(path.exists());
    }

    #[test]
    fn busy_writer_defers_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::sync_channel::<Table>(1);
        let mut writer = CheckpointWriter {
            path: dir.path().join("out.csv"),
            schedule: every(3),
            last_write: Instant::now(),
            due: false,
            written: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            tx: Some(tx.clone()),
            worker: None,
        };
        // Occupy the only slot, as a slow disk would
        tx.send(Table::new(vec![], vec![])).unwrap();

        let mut rt = result_table(6);
        for i in 0..4 {
            rt.apply(i, &EnrichmentResult::Success(Price::new(1.0, "USD")));
            assert!(!writer.maybe_checkpoint(i as u64 + 1, &rt));
        }
        assert!(writer.due);

        rx.recv().unwrap();
        rt.apply(4, &EnrichmentResult::Success(Price::new(1.0, "USD")));
        assert!(writer.maybe_checkpoint(5, &rt));
        assert!(!writer.due);

        let snapshot = rx.try_recv().unwrap();
        let col = snapshot.column("price_status").unwrap();
        let ok = snapshot.rows().iter().filter(|r| r[col] == "ok").count();
        assert_eq!(ok, 5);
    }
}
