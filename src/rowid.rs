//! Row-identifier capture and positional extraction.
//!
//! The captured set of `ctid` values is the unit of consistency for the
//! whole copy: the key query runs exactly once, and every later fetch is
//! keyed strictly by these identifiers. After capture the store is
//! read-only and safe for concurrent positional reads, one reader per
//! worker.

use crate::config::StoreBackend;
use crate::error::{PipeError, Result};
use futures::{pin_mut, TryStreamExt};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::Instant;
use tokio_postgres::Client;
use tracing::{info, warn};

/// Store for captured row identifiers. Backend selection is a
/// configuration choice resolved once at table-open time; the hot copy
/// loop dispatches statically over this enum.
pub enum RowIdStore {
    Memory(MemoryStore),
    Log(LogStore),
}

impl RowIdStore {
    /// Create an empty store for the chosen backend.
    pub fn new(backend: StoreBackend, schema: &str, table: &str) -> Result<Self> {
        match backend {
            StoreBackend::Memory => Ok(RowIdStore::Memory(MemoryStore::new())),
            StoreBackend::Log => Ok(RowIdStore::Log(LogStore::create(schema, table)?)),
        }
    }

    /// Execute the key query to completion and capture every returned
    /// identifier in original result order. Runs exactly once per store.
    pub async fn capture(&mut self, client: &Client, key_sql: &str) -> Result<()> {
        let started = Instant::now();
        let params: Vec<String> = Vec::new();
        let stream = client.query_raw(key_sql, params).await?;
        pin_mut!(stream);

        match self {
            RowIdStore::Memory(s) => {
                while let Some(row) = stream.try_next().await? {
                    s.push(row.try_get::<_, String>(0)?);
                }
            }
            RowIdStore::Log(s) => {
                while let Some(row) = stream.try_next().await? {
                    s.append(&row.try_get::<_, String>(0)?)?;
                }
                s.finish()?;
            }
        }

        info!(
            rows = self.count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Captured row identifiers"
        );
        Ok(())
    }

    /// Total number of captured identifiers.
    pub fn count(&self) -> usize {
        match self {
            RowIdStore::Memory(s) => s.count(),
            RowIdStore::Log(s) => s.count(),
        }
    }

    /// Extract identifiers in `[start, end)`, positionally and
    /// deterministically, as a bind array for the fetch query.
    pub fn extract(&self, start: usize, end: usize) -> Result<Vec<String>> {
        debug_assert!(start <= end && end <= self.count());
        match self {
            RowIdStore::Memory(s) => Ok(s.extract(start, end)),
            RowIdStore::Log(s) => s.extract(start, end),
        }
    }

    /// Discard all resources, including on-disk artifacts.
    pub fn release(&self) {
        if let RowIdStore::Log(s) = self {
            s.remove_artifacts();
        }
    }
}

/// In-process ordered list backend.
pub struct MemoryStore {
    keys: Vec<String>,
}

impl MemoryStore {
    fn new() -> Self {
        Self { keys: Vec::new() }
    }

    fn push(&mut self, key: String) {
        self.keys.push(key);
    }

    fn count(&self) -> usize {
        self.keys.len()
    }

    fn extract(&self, start: usize, end: usize) -> Vec<String> {
        self.keys[start..end].to_vec()
    }
}

/// Append-only on-disk log backend for identifier sets too large to hold
/// resident. Records are u16-length-prefixed; extraction opens an
/// independent reader per call and skips `start` records, so cost is
/// proportional to `start` plus the extracted span. Workers walk their
/// ranges in increasing order, which keeps the skip cheap in practice.
pub struct LogStore {
    dir: PathBuf,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    count: usize,
}

impl LogStore {
    fn create(schema: &str, table: &str) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!(
            "rowpipe-{}_{}-{}",
            schema,
            table,
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&dir)?;
        let path = dir.join("rowids.log");
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        info!(dir = %dir.display(), "Created row-identifier scratch log");
        Ok(Self {
            dir,
            path,
            writer: Some(BufWriter::new(file)),
            count: 0,
        })
    }

    fn append(&mut self, key: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipeError::RowIdStore("append after capture completed".into()))?;
        let bytes = key.as_bytes();
        let len = u16::try_from(bytes.len())
            .map_err(|_| PipeError::RowIdStore(format!("identifier too long: {} bytes", bytes.len())))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(bytes)?;
        self.count += 1;
        Ok(())
    }

    /// Flush and seal the log; capture-then-read is a strict ordering.
    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn count(&self) -> usize {
        self.count
    }

    fn extract(&self, start: usize, end: usize) -> Result<Vec<String>> {
        if self.writer.is_some() {
            return Err(PipeError::RowIdStore("extract before capture completed".into()));
        }
        let mut reader = BufReader::new(File::open(&self.path)?);
        for _ in 0..start {
            let len = read_len(&mut reader)?;
            std::io::copy(&mut (&mut reader).take(len as u64), &mut std::io::sink())?;
        }
        let mut keys = Vec::with_capacity(end - start);
        for _ in start..end {
            let len = read_len(&mut reader)?;
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            keys.push(String::from_utf8(buf).map_err(|e| PipeError::RowIdStore(e.to_string()))?);
        }
        Ok(keys)
    }

    fn remove_artifacts(&self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!(
                dir = %self.dir.display(),
                error = %e,
                "Unable to delete row-identifier scratch log"
            );
        }
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn read_len(reader: &mut impl Read) -> Result<u16> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    Ok(u16::from_le_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("({},{})", i / 100, i % 100 + 1)).collect()
    }

    fn filled_log(ids: &[String]) -> LogStore {
        let mut store = LogStore::create("test", "t").unwrap();
        for id in ids {
            store.append(id).unwrap();
        }
        store.finish().unwrap();
        store
    }

    #[test]
    fn memory_round_trip_whole_and_piecewise() {
        let ids = sample_ids(257);
        let mut store = MemoryStore::new();
        for id in &ids {
            store.push(id.clone());
        }
        assert_eq!(store.count(), 257);
        assert_eq!(store.extract(0, 257), ids);

        // Arbitrary contiguous sub-ranges concatenate to the same sequence.
        let mut pieced = Vec::new();
        for (a, b) in [(0, 100), (100, 101), (101, 257)] {
            pieced.extend(store.extract(a, b));
        }
        assert_eq!(pieced, ids);
    }

    #[test]
    fn log_round_trip_whole_and_piecewise() {
        let ids = sample_ids(300);
        let store = filled_log(&ids);
        assert_eq!(store.count(), 300);
        assert_eq!(store.extract(0, 300).unwrap(), ids);

        let mut pieced = Vec::new();
        for (a, b) in [(0, 7), (7, 150), (150, 150), (150, 300)] {
            pieced.extend(store.extract(a, b).unwrap());
        }
        assert_eq!(pieced, ids);
    }

    #[test]
    fn log_supports_concurrent_readers() {
        let ids = sample_ids(64);
        let store = std::sync::Arc::new(filled_log(&ids));
        let mut handles = Vec::new();
        for w in 0..4 {
            let store = store.clone();
            let expect = ids[w * 16..(w + 1) * 16].to_vec();
            handles.push(std::thread::spawn(move || {
                let got = store.extract(w * 16, (w + 1) * 16).unwrap();
                assert_eq!(got, expect);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn log_extract_before_seal_is_rejected() {
        let mut store = LogStore::create("test", "t").unwrap();
        store.append("(0,1)").unwrap();
        assert!(store.extract(0, 1).is_err());
    }

    #[test]
    fn log_artifacts_removed_on_release() {
        let store = filled_log(&sample_ids(3));
        let dir = store.dir.clone();
        assert!(dir.exists());
        store.remove_artifacts();
        assert!(!dir.exists());
    }
}
