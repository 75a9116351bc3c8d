use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointSchedule, CheckpointWriter};
use crate::enrich::language::select_non_english;
use crate::enrich::{EnrichedValue, Enricher, Task};
use crate::merge::{ResultTable, RowStatus};
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::table::Table;

/// How one enrichment stage reads, schedules and persists.
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub pool_size: usize,
    pub checkpoint: CheckpointSchedule,
    /// Carry over finished rows from an existing output file.
    pub resume: bool,
    /// With `resume`, enrich rows that previously fell back again.
    pub retry_fallbacks: bool,
    /// Only enrich rows whose input looks non-English.
    pub only_non_english: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: &'static str,
    pub total_rows: usize,
    pub restored: usize,
    pub tasks: usize,
    pub succeeded: usize,
    pub fallback: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub checkpoints: usize,
    pub output: PathBuf,
}

pub fn status_column(stage: &str) -> String {
    format!("{}_status", stage)
}

/// Enrich every row of `opts.input` and write the result table to
/// `opts.output`, checkpointing along the way.
pub async fn run_stage<E: Enricher>(
    enricher: Arc<E>,
    policy: RetryPolicy,
    opts: &StageOptions,
    cancel: CancellationToken,
) -> Result<StageReport> {
    let stage = enricher.name();
    let table = Table::read_csv(&opts.input)?;
    let input_col = table.column(enricher.input_column()).with_context(|| {
        format!(
            "{:?} has no {:?} column",
            opts.input,
            enricher.input_column()
        )
    })?;
    let inputs: Vec<String> = table.rows().iter().map(|r| r[input_col].clone()).collect();
    info!(stage, rows = inputs.len(), input = ?opts.input, "loaded input");

    let status_col = status_column(stage);
    let mut results =
        ResultTable::prepare::<E::Output, _>(table, &status_col, |i| enricher.pending(&inputs[i]));

    let mut restored = 0;
    if opts.resume && opts.output.exists() {
        restored = restore_finished::<E::Output>(
            &mut results,
            (input_col, enricher.input_column()),
            &opts.output,
            &status_col,
            opts.retry_fallbacks,
        )?;
        info!(stage, restored, "resumed from {:?}", opts.output);
    }

    let open: Vec<usize> = (0..inputs.len())
        .filter(|&i| results.status(i) == Some(RowStatus::Pending))
        .collect();
    let selected = if opts.only_non_english {
        let picked = select_non_english(
            open.iter()
                .map(|&i| (i, inputs[i].as_str()))
                .collect::<Vec<_>>(),
        );
        for &i in &open {
            if picked.binary_search(&i).is_err() {
                results.mark_skipped(i, &enricher.pending(&inputs[i]));
            }
        }
        info!(stage, selected = picked.len(), of = open.len(), "filtered to non-English rows");
        picked
    } else {
        open
    };

    let tasks: Vec<Task> = selected
        .into_iter()
        .map(|index| Task {
            index,
            input: inputs[index].clone(),
        })
        .collect();
    let task_count = tasks.len();
    info!(stage, tasks = task_count, pool = opts.pool_size, "dispatching");

    let pb = ProgressBar::new(task_count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );
    pb.set_message(stage);

    let mut writer = CheckpointWriter::start(&opts.output, opts.checkpoint)?;
    let scheduler = Scheduler::new(opts.pool_size, cancel);
    let started = Instant::now();
    let mut completed = 0u64;
    let mut succeeded = 0usize;
    let mut fallback = 0usize;

    let stats = scheduler
        .run(tasks, enricher, Arc::new(policy), |index, result| {
            if result.is_success() {
                succeeded += 1;
            } else {
                fallback += 1;
            }
            results.apply(index, &result);
            completed += 1;
            writer.maybe_checkpoint(completed, &results);
            pb.inc(1);
        })
        .await;
    pb.finish_and_clear();

    let snapshot = results.snapshot();
    let summary = tokio::task::spawn_blocking(move || writer.finish(&snapshot))
        .await
        .context("Final checkpoint task failed")??;

    let pending = results.count(RowStatus::Pending);
    if pending > 0 {
        warn!(stage, pending, "rows left pending; rerun with --resume to finish them");
    }
    info!(
        stage,
        succeeded,
        fallback,
        elapsed_secs = started.elapsed().as_secs_f64(),
        output = ?summary.path,
        "stage finished"
    );

    Ok(StageReport {
        stage,
        total_rows: results.len(),
        restored,
        tasks: task_count,
        succeeded,
        fallback,
        skipped: results.count(RowStatus::Skipped),
        cancelled: stats.interrupted + stats.not_dispatched,
        pending,
        checkpoints: summary.written,
        output: summary.path,
    })
}

/// Copy finished rows from an earlier output of this stage. The earlier file
/// must describe the same input: same row count and an identical input column.
/// Columns written by upstream stages may have changed since and are ignored.
fn restore_finished<T: EnrichedValue>(
    results: &mut ResultTable,
    (input_col, input_name): (usize, &str),
    path: &Path,
    status_col: &str,
    retry_fallbacks: bool,
) -> Result<usize> {
    let previous = Table::read_csv(path)?;
    if previous.len() != results.len() {
        bail!(
            "{:?} has {} rows but the input has {}; refusing to resume",
            path,
            previous.len(),
            results.len()
        );
    }

    let prev_input = previous
        .column(input_name)
        .with_context(|| format!("{:?} lacks input column {:?}", path, input_name))?;
    let value_cols = T::columns()
        .iter()
        .map(|c| {
            previous
                .column(c)
                .with_context(|| format!("{:?} lacks column {:?}", path, c))
        })
        .collect::<Result<Vec<_>>>()?;
    let prev_status = previous
        .column(status_col)
        .with_context(|| format!("{:?} lacks column {:?}", path, status_col))?;

    let mut restored = 0;
    for i in 0..previous.len() {
        if results.table().cell(i, input_col) != previous.cell(i, prev_input) {
            bail!(
                "row {} of {:?} has a different {:?}; refusing to resume",
                i,
                path,
                input_name
            );
        }

        let status: RowStatus = previous.cell(i, prev_status).unwrap_or("").parse()?;
        let keep = match status {
            RowStatus::Ok | RowStatus::Skipped => true,
            RowStatus::Fallback => !retry_fallbacks,
            RowStatus::Pending => false,
        };
        if keep {
            let cells = value_cols
                .iter()
                .map(|&c| previous.cell(i, c).unwrap_or("").to_string())
                .collect();
            results.restore(i, cells, status);
            restored += 1;
        }
    }
    Ok(restored)
}

// ── Tests ──
