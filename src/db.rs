use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            id           INTEGER PRIMARY KEY,
            run_id       TEXT NOT NULL,
            stage        TEXT NOT NULL,
            input_path   TEXT NOT NULL,
            output_path  TEXT NOT NULL,
            total_rows   INTEGER NOT NULL DEFAULT 0,
            tasks        INTEGER NOT NULL DEFAULT 0,
            succeeded    INTEGER NOT NULL DEFAULT 0,
            fallback     INTEGER NOT NULL DEFAULT 0,
            skipped      INTEGER NOT NULL DEFAULT 0,
            cancelled    INTEGER NOT NULL DEFAULT 0,
            checkpoints  INTEGER NOT NULL DEFAULT 0,
            error        TEXT,
            started_at   TEXT NOT NULL,
            finished_at  TEXT,
            UNIQUE(run_id, stage)
        );
        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
        ",
    )?;
    Ok(())
}

pub struct RunRow {
    pub run_id: String,
    pub stage: String,
    pub input_path: String,
    pub output_path: String,
    pub total_rows: usize,
    pub tasks: usize,
    pub succeeded: usize,
    pub fallback: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub checkpoints: usize,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Millisecond timestamp, process id and a per-process counter, so runs
/// started in the same second (or by parallel processes) get distinct ids.
pub fn new_run_id() -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    format!(
        "run-{}-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"),
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Fails if `(run_id, stage)` is already recorded rather than replacing it.
pub fn start_run(
    conn: &Connection,
    run_id: &str,
    stage: &str,
    input: &Path,
    output: &Path,
    started_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO runs (run_id, stage, input_path, output_path, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            run_id,
            stage,
            input.display().to_string(),
            output.display().to_string(),
            started_at,
        ],
    )?;
    Ok(())
}

pub fn finish_run(conn: &Connection, row: &RunRow) -> Result<()> {
    conn.execute(
        "UPDATE runs SET output_path = ?3, total_rows = ?4, tasks = ?5, succeeded = ?6,
                fallback = ?7, skipped = ?8, cancelled = ?9, checkpoints = ?10,
                error = ?11, finished_at = ?12
         WHERE run_id = ?1 AND stage = ?2",
        rusqlite::params![
            row.run_id,
            row.stage,
            row.output_path,
            row.total_rows,
            row.tasks,
            row.succeeded,
            row.fallback,
            row.skipped,
            row.cancelled,
            row.checkpoints,
            row.error,
            row.finished_at,
        ],
    )?;
    Ok(())
}

pub fn fetch_recent_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, stage, input_path, output_path, total_rows, tasks, succeeded,
                fallback, skipped, cancelled, checkpoints, error, started_at, finished_at
         FROM runs
         ORDER BY started_at DESC, id DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            Ok(RunRow {
                run_id: row.get(0)?,
                stage: row.get(1)?,
                input_path: row.get(2)?,
                output_path: row.get(3)?,
                total_rows: row.get(4)?,
                tasks: row.get(5)?,
                succeeded: row.get(6)?,
                fallback: row.get(7)?,
                skipped: row.get(8)?,
                cancelled: row.get(9)?,
                checkpoints: row.get(10)?,
                error: row.get(11)?,
                started_at: row.get(12)?,
                finished_at: row.get(13)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
