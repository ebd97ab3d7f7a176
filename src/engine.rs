//! Copy engine: capture, partition, and parallel transfer.
//!
//! The run is one pass: capture the full row-identifier set with a single
//! key query, split it into contiguous per-worker ranges, and let each
//! worker walk its range in bind-array-sized sub-batches with its own
//! source and destination connections. Worker failures are isolated; the
//! run reports them without cancelling siblings.

use crate::config::{local_core_count, Config};
use crate::dest::DestWriter;
use crate::error::{PipeError, Result};
use crate::pool::PipePool;
use crate::rowid::RowIdStore;
use crate::table::TableDescriptor;
use crate::value::SqlValue;
use futures::{pin_mut, TryStreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, error, info};

/// Largest identifier bind array sent in one fetch.
pub const MAX_BIND_ROWS: usize = 32767;

/// Per-worker progress log interval, in rows.
const PROGRESS_LOG_EVERY: usize = 1000;

/// Outcome of one worker's range.
#[derive(Debug)]
pub struct WorkerReport {
    pub worker: usize,
    pub start: usize,
    pub end: usize,
    pub rows: usize,
    pub commits: usize,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Outcome of a whole run.
#[derive(Debug)]
pub struct CopySummary {
    /// Identifiers captured by the key query.
    pub row_count: usize,
    /// Rows actually written to the destination.
    pub rows_copied: usize,
    pub degree: usize,
    pub elapsed: Duration,
    pub workers: Vec<WorkerReport>,
}

impl CopySummary {
    /// Whether every worker finished its range without error.
    pub fn success(&self) -> bool {
        self.workers.iter().all(|w| w.error.is_none())
    }
}

/// Split `[0, total)` into `degree` contiguous ranges whose sizes differ
/// by at most one. Returns fewer ranges than `degree` when `total` is
/// smaller.
pub fn split_ranges(total: usize, degree: usize) -> Vec<(usize, usize)> {
    let degree = degree.min(total);
    if degree == 0 {
        return Vec::new();
    }
    let base = total / degree;
    let remainder = total % degree;
    let mut ranges = Vec::with_capacity(degree);
    let mut start = 0;
    for i in 0..degree {
        let size = base + usize::from(i < remainder);
        ranges.push((start, start + size));
        start += size;
    }
    ranges
}

/// Split one worker range into sub-batches no larger than `max`.
pub fn sub_batches(start: usize, end: usize, max: usize) -> Vec<(usize, usize)> {
    debug_assert!(max > 0);
    let mut batches = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + max).min(end);
        batches.push((cursor, next));
        cursor = next;
    }
    batches
}

/// Commit cadence tracker: counts rows since the last commit and decides
/// when a destination transaction is due.
pub struct CommitCadence {
    threshold: usize,
    since: usize,
    commits: usize,
}

impl CommitCadence {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            since: 0,
            commits: 0,
        }
    }

    /// Record one buffered row; true when the buffer reached the threshold
    /// and must be committed.
    pub fn row(&mut self) -> bool {
        self.since += 1;
        if self.since >= self.threshold {
            self.since = 0;
            self.commits += 1;
            true
        } else {
            false
        }
    }

    /// Close out a sub-batch; true when a partial buffer remains to commit.
    pub fn finish(&mut self) -> bool {
        if self.since > 0 {
            self.since = 0;
            self.commits += 1;
            true
        } else {
            false
        }
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

/// One-shot parallel table copy.
pub struct CopyEngine {
    config: Config,
}

impl CopyEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Execute the copy and return its summary. A summary with failed
    /// workers is still `Ok`; hard failures before workers start are `Err`.
    pub async fn run(&self) -> Result<CopySummary> {
        let started = Instant::now();
        let source = PipePool::connect("source", &self.config.source).await?;
        let dest = PipePool::connect("destination", &self.config.destination).await?;

        let degree = self
            .config
            .copy
            .degree
            .unwrap_or_else(|| {
                local_core_count()
                    .min(source.capacity_hint())
                    .min(dest.capacity_hint())
            })
            .max(1);
        source.resize(degree).await;
        dest.resize(degree).await;

        let capture_conn = source.acquire().await?.into_postgres()?;
        let table = Arc::new(TableDescriptor::open(&capture_conn, &self.config, dest.family()).await?);

        let mut store = RowIdStore::new(
            self.config.copy.rowid_store,
            &table.source_schema,
            &table.source_table,
        )?;
        store.capture(&capture_conn, &table.key_sql).await?;
        drop(capture_conn);

        let row_count = store.count();
        if row_count == 0 {
            info!("No rows match the copy set; nothing to do");
            store.release();
            source.close().await;
            dest.close().await;
            return Ok(CopySummary {
                row_count: 0,
                rows_copied: 0,
                degree,
                elapsed: started.elapsed(),
                workers: Vec::new(),
            });
        }

        let degree = degree.min(row_count);
        let ranges = split_ranges(row_count, degree);
        info!(rows = row_count, degree, "Starting parallel copy");

        // Acquire every worker's connection pair up front so a saturated
        // pool fails the run before any rows move.
        let mut handles = Vec::with_capacity(ranges.len());
        let store = Arc::new(store);
        for (worker, &(start, end)) in ranges.iter().enumerate() {
            let src_conn = source.acquire().await?.into_postgres()?;
            let writer = DestWriter::new(dest.acquire().await?, &table).await?;
            let table = Arc::clone(&table);
            let store = Arc::clone(&store);
            let commit_after = self.config.copy.commit_after;
            let fetch_all_rows = self.config.copy.fetch_all_rows;
            handles.push(tokio::spawn(async move {
                run_worker(
                    worker,
                    start,
                    end,
                    src_conn,
                    writer,
                    table,
                    store,
                    commit_after,
                    fetch_all_rows,
                )
                .await
            }));
        }

        let mut workers = Vec::with_capacity(handles.len());
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(report) => workers.push(report),
                Err(e) => {
                    let (start, end) = ranges[worker];
                    workers.push(WorkerReport {
                        worker,
                        start,
                        end,
                        rows: 0,
                        commits: 0,
                        elapsed: Duration::ZERO,
                        error: Some(PipeError::worker(worker, format!("task panicked: {}", e)).to_string()),
                    });
                }
            }
        }

        store.release();
        source.close().await;
        dest.close().await;

        let summary = CopySummary {
            row_count,
            rows_copied: workers.iter().map(|w| w.rows).sum(),
            degree,
            elapsed: started.elapsed(),
            workers,
        };
        if summary.success() {
            info!(
                rows = summary.rows_copied,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Copy complete"
            );
        } else {
            for w in summary.workers.iter().filter(|w| w.error.is_some()) {
                error!(
                    worker = w.worker,
                    range = format!("[{}, {})", w.start, w.end),
                    error = w.error.as_deref().unwrap_or(""),
                    "Worker failed"
                );
            }
        }
        Ok(summary)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker: usize,
    start: usize,
    end: usize,
    src_conn: deadpool_postgres::Object,
    writer: DestWriter,
    table: Arc<TableDescriptor>,
    store: Arc<RowIdStore>,
    commit_after: usize,
    fetch_all_rows: bool,
) -> WorkerReport {
    let started = Instant::now();
    let mut rows = 0;
    let mut cadence = CommitCadence::new(commit_after);
    let result = copy_range(
        worker,
        start,
        end,
        &src_conn,
        writer,
        &table,
        &store,
        &mut cadence,
        &mut rows,
        fetch_all_rows,
    )
    .await;
    WorkerReport {
        worker,
        start,
        end,
        rows,
        commits: cadence.commits(),
        elapsed: started.elapsed(),
        error: result.err().map(|e| e.format_detailed()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn copy_range(
    worker: usize,
    start: usize,
    end: usize,
    src_conn: &deadpool_postgres::Object,
    mut writer: DestWriter,
    table: &TableDescriptor,
    store: &RowIdStore,
    cadence: &mut CommitCadence,
    rows: &mut usize,
    fetch_all_rows: bool,
) -> Result<()> {
    let fetch = src_conn
        .prepare_typed(&table.fetch_sql, &[Type::TEXT_ARRAY])
        .await?;
    debug!(worker, start, end, "Worker started");

    let mut buffer: Vec<Vec<SqlValue>> = Vec::with_capacity(cadence.threshold);
    for (batch_start, batch_end) in sub_batches(start, end, MAX_BIND_ROWS) {
        let ids = store.extract(batch_start, batch_end)?;

        if fetch_all_rows {
            for row in src_conn.query(&fetch, &[&ids]).await? {
                buffer.push(table.decode_row(&row)?);
                *rows += 1;
                if *rows % PROGRESS_LOG_EVERY == 0 {
                    info!(worker, rows = *rows, "Copied rows");
                }
                if cadence.row() {
                    writer.write_commit(&buffer).await?;
                    buffer.clear();
                }
            }
        } else {
            let params: Vec<&(dyn ToSql + Sync)> = vec![&ids];
            let stream = src_conn.query_raw(&fetch, params).await?;
            pin_mut!(stream);
            while let Some(row) = stream.try_next().await? {
                buffer.push(table.decode_row(&row)?);
                *rows += 1;
                if *rows % PROGRESS_LOG_EVERY == 0 {
                    info!(worker, rows = *rows, "Copied rows");
                }
                if cadence.row() {
                    writer.write_commit(&buffer).await?;
                    buffer.clear();
                }
            }
        }

        // Commit the partial buffer so every sub-batch lands durably
        // before the next bind array is extracted.
        if cadence.finish() {
            writer.write_commit(&buffer).await?;
            buffer.clear();
        }
    }

    debug!(worker, rows = *rows, commits = cadence.commits(), "Worker finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(total: usize, degree: usize) {
        let ranges = split_ranges(total, degree);
        assert_eq!(ranges.len(), degree.min(total));
        // Contiguous, disjoint, covering.
        let mut cursor = 0;
        for &(s, e) in &ranges {
            assert_eq!(s, cursor);
            assert!(e > s);
            cursor = e;
        }
        assert_eq!(cursor, total);
        // Sizes differ by at most one.
        let sizes: Vec<usize> = ranges.iter().map(|&(s, e)| e - s).collect();
        let min = sizes.iter().min().copied().unwrap_or(0);
        let max = sizes.iter().max().copied().unwrap_or(0);
        assert!(max - min <= 1, "sizes {:?}", sizes);
    }

    #[test]
    fn ranges_partition_evenly() {
        assert_partition(120, 4);
        assert_eq!(
            split_ranges(120, 4),
            vec![(0, 30), (30, 60), (60, 90), (90, 120)]
        );
        assert_partition(121, 4);
        assert_partition(7, 3);
        assert_partition(1_000_003, 16);
    }

    #[test]
    fn degree_clamps_to_row_count() {
        assert_eq!(split_ranges(3, 8), vec![(0, 1), (1, 2), (2, 3)]);
        assert!(split_ranges(0, 4).is_empty());
    }

    #[test]
    fn sub_batches_cover_range_within_limit() {
        let batches = sub_batches(0, 70_000, MAX_BIND_ROWS);
        assert_eq!(batches, vec![(0, 32767), (32767, 65534), (65534, 70_000)]);
        assert!(batches.iter().all(|&(s, e)| e - s <= MAX_BIND_ROWS));
        assert_eq!(batches.iter().map(|&(s, e)| e - s).sum::<usize>(), 70_000);

        // A range within the limit stays whole.
        assert_eq!(sub_batches(10, 50, MAX_BIND_ROWS), vec![(10, 50)]);
        assert!(sub_batches(5, 5, MAX_BIND_ROWS).is_empty());
    }

    #[test]
    fn cadence_commits_at_threshold_and_remainder() {
        let mut cadence = CommitCadence::new(50);
        let mut flushes = 0;
        for _ in 0..120 {
            if cadence.row() {
                flushes += 1;
            }
        }
        assert_eq!(flushes, 2);
        assert!(cadence.finish());
        assert_eq!(cadence.commits(), 3);

        // Exact multiple leaves nothing to flush.
        let mut exact = CommitCadence::new(50);
        for _ in 0..100 {
            exact.row();
        }
        assert!(!exact.finish());
        assert_eq!(exact.commits(), 2);
    }

    #[test]
    fn cadence_of_one_commits_every_row() {
        let mut cadence = CommitCadence::new(1);
        assert!(cadence.row());
        assert!(cadence.row());
        assert!(!cadence.finish());
        assert_eq!(cadence.commits(), 2);
    }
}
