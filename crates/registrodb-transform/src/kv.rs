//! Relational staging into an embedded key-value store.
//!
//! Phase A materializes every auxiliary CSV stream into RocksDB so Phase B
//! can join venues by base ID with point reads and prefix scans. Per source
//! kind the fan-out is:
//!
//! ```text
//! reader (blocking) ──▶ row channel (1000) ──▶ chunker ──▶ chunk channel
//!                                                              │
//!                                              writer workers (≤ 8), one
//!                                              WriteBatch commit per chunk
//! ```
//!
//! All seven kinds run concurrently against one writer handle; RocksDB
//! serializes the batch commits internally. The first failure anywhere
//! cancels the shared token, which every reader and chunker observes
//! between rows.
//!
//! The store is tuned for a one-shot bulk load on limited memory: a single
//! 16 MiB memtable, aggressive level-0 stalls, and 64 MiB value-log (blob)
//! files collected by a periodic compaction pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rocksdb::{Options, WriteBatch, DB};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransformError};
use crate::lookups::Lookups;
use crate::rows::{decode_staged, StagedRow};
use crate::source::{Source, SourceKind};

/// Entries committed in one write batch.
const CHUNK_SIZE: usize = 1000;

/// Cap on chunk-writer workers per source kind.
const MAX_CHUNK_WORKERS: usize = 8;

/// Bounded row channel between a reader and its chunker.
const ROW_CHANNEL_CAPACITY: usize = 1000;

/// Interval between value-log compaction passes.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// The embedded store staging Phase A and serving Phase B lookups.
pub struct KvStore {
    db: DB,
    path: PathBuf,
}

impl KvStore {
    fn tuned_options() -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        // One active memtable of 16 MiB, stall early at level 0.
        opts.set_max_write_buffer_number(1);
        opts.set_write_buffer_size(16 << 20);
        opts.set_level_zero_slowdown_writes_trigger(2);
        opts.set_level_zero_stop_writes_trigger(2);
        // Keep values out of the LSM tree, in 64 MiB log files.
        opts.set_enable_blob_files(true);
        opts.set_blob_file_size(64 << 20);
        opts.set_min_blob_size(256);
        opts.set_enable_blob_gc(true);
        opts
    }

    /// Create a fresh store for the Phase A write path.
    pub fn create(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "creating temporary key-value storage");
        let db = DB::open(&Self::tuned_options(), path)?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Reopen an existing store read-only for the Phase B join.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let db = DB::open_for_read_only(&Self::tuned_options(), path, false)?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Commit a whole chunk atomically.
    pub fn write_chunk(&self, chunk: &[StagedRow]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for item in chunk {
            batch.put(&item.key, &item.value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// Values of every entry whose key starts with `prefix`, in key order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        for item in self.db.prefix_iterator(prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(value.to_vec());
        }
        Ok(values)
    }

    /// Force memtable contents down so a read-only reopen sees everything.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// One value-log reclamation pass. Fire-and-forget: compaction runs in
    /// the background and a pass that finds nothing to rewrite is a no-op.
    fn collect_garbage(&self) {
        tracing::debug!("running key-value garbage collection");
        self.db.compact_range::<&[u8], &[u8]>(None, None);
    }
}

/// Stage all seven auxiliary kinds concurrently.
///
/// Returns once every kind is fully staged and flushed, or with the first
/// error after the whole group has wound down.
pub async fn stage_all(
    dir: &Path,
    kv: Arc<KvStore>,
    lookups: Arc<Lookups>,
    parallelism: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let workers = parallelism.clamp(1, MAX_CHUNK_WORKERS);
    let sources = SourceKind::STAGED
        .iter()
        .map(|kind| Source::open(dir, *kind))
        .collect::<Result<Vec<_>>>()?;
    let total: u64 = sources.iter().map(Source::total_rows).sum();

    let bar = ProgressBar::new(total);
    bar.set_style(progress_style());
    bar.set_message("Staging bases, partners and taxes");

    let gc = spawn_gc_task(kv.clone(), cancel.clone());

    let mut handles = Vec::with_capacity(sources.len());
    for source in sources {
        handles.push(tokio::spawn(load_source(
            kv.clone(),
            source,
            lookups.clone(),
            bar.clone(),
            workers,
            cancel.clone(),
        )));
    }

    let mut first_error = None;
    for handle in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(TransformError::from(e)),
        };
        if let Err(e) = outcome {
            cancel.cancel();
            first_error.get_or_insert(e);
        }
    }
    gc.abort();
    let _ = gc.await;
    bar.finish_and_clear();

    if let Some(e) = first_error {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(TransformError::Canceled);
    }
    kv.flush()?;
    Ok(())
}

pub(crate) fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg:40} [{bar:25}] {percent:>3}% {human_pos}/{human_len} ({per_sec})")
        .expect("static progress template")
}

fn spawn_gc_task(kv: Arc<KvStore>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + GC_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, GC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let kv = kv.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || kv.collect_garbage()).await {
                        tracing::warn!(error = %e, "garbage-collection task failed");
                    }
                }
            }
        }
    })
}

/// Run one kind's reader → chunker → writer-pool pipeline to completion.
async fn load_source(
    kv: Arc<KvStore>,
    source: Source,
    lookups: Arc<Lookups>,
    bar: ProgressBar,
    workers: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let kind = source.kind();

    let (row_tx, row_rx) = mpsc::channel::<Vec<String>>(ROW_CHANNEL_CAPACITY);
    let reader = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || source.send_to(&cancel, &row_tx))
    };

    let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<StagedRow>>(workers * 2);
    let chunker = tokio::spawn(chunk_rows(kind, lookups, row_rx, chunk_tx, cancel.clone()));

    let chunk_rx = Arc::new(Mutex::new(chunk_rx));
    let mut writer_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let kv = kv.clone();
        let chunk_rx = chunk_rx.clone();
        let bar = bar.clone();
        let cancel = cancel.clone();
        writer_handles.push(tokio::spawn(async move {
            loop {
                let chunk = chunk_rx.lock().await.recv().await;
                let Some(chunk) = chunk else {
                    return Ok(());
                };
                let len = chunk.len();
                let kv = kv.clone();
                match tokio::task::spawn_blocking(move || kv.write_chunk(&chunk)).await {
                    Ok(Ok(())) => bar.inc(len as u64),
                    Ok(Err(e)) => {
                        cancel.cancel();
                        return Err(e);
                    }
                    Err(e) => {
                        cancel.cancel();
                        return Err(TransformError::from(e));
                    }
                }
            }
        }));
    }

    let mut first_error = None;
    let mut note = |outcome: Result<()>| {
        if let Err(e) = outcome {
            cancel.cancel();
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    };
    note(reader.await.map_err(TransformError::from).and_then(|r| r));
    note(chunker.await.map_err(TransformError::from).and_then(|r| r));
    for handle in writer_handles {
        note(handle.await.map_err(TransformError::from).and_then(|r| r));
    }
    match first_error {
        Some(e) => {
            tracing::error!(kind = %kind, error = %e, "staging failed");
            Err(e)
        }
        None => Ok(()),
    }
}

/// Group decoded rows into fixed-size chunks. Undecodable rows are logged
/// and skipped, never fatal.
async fn chunk_rows(
    kind: SourceKind,
    lookups: Arc<Lookups>,
    mut row_rx: mpsc::Receiver<Vec<String>>,
    chunk_tx: mpsc::Sender<Vec<StagedRow>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut chunk = Vec::with_capacity(CHUNK_SIZE);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Hand over whatever is pending before winding down.
                if !chunk.is_empty() {
                    let _ = chunk_tx.send(chunk).await;
                }
                return Ok(());
            }
            row = row_rx.recv() => match row {
                Some(row) => {
                    match decode_staged(kind, &lookups, &row) {
                        Ok(item) => chunk.push(item),
                        Err(e) => {
                            tracing::warn!(kind = %kind, error = %e, "skipping undecodable row");
                            continue;
                        }
                    }
                    if chunk.len() >= CHUNK_SIZE {
                        let full = std::mem::replace(&mut chunk, Vec::with_capacity(CHUNK_SIZE));
                        if chunk_tx.send(full).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                None => {
                    if !chunk.is_empty() {
                        let _ = chunk_tx.send(chunk).await;
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(key: &str, value: &[u8]) -> StagedRow {
        StagedRow {
            key: key.as_bytes().to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn chunk_commits_atomically_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::create(dir.path()).unwrap();
        kv.write_chunk(&[
            staged("base:12345678", b"acme"),
            staged("partner:12345678:aa", b"alice"),
            staged("partner:12345678:bb", b"bob"),
        ])
        .unwrap();

        assert_eq!(kv.get(b"base:12345678").unwrap(), Some(b"acme".to_vec()));
        assert_eq!(kv.get(b"base:99999999").unwrap(), None);
    }

    #[test]
    fn prefix_scan_stays_inside_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::create(dir.path()).unwrap();
        kv.write_chunk(&[
            staged("partner:11111111:aa", b"a"),
            staged("partner:11111111:bb", b"b"),
            staged("partner:11111112:cc", b"other"),
            staged("simple:11111111:dd", b"tax"),
        ])
        .unwrap();

        let values = kv.scan_prefix(b"partner:11111111:").unwrap();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(kv.scan_prefix(b"partner:22222222:").unwrap().is_empty());
    }

    #[test]
    fn read_only_reopen_sees_flushed_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = KvStore::create(dir.path()).unwrap();
            kv.write_chunk(&[staged("base:12345678", b"acme")]).unwrap();
            kv.flush().unwrap();
        }
        let ro = KvStore::open_read_only(dir.path()).unwrap();
        assert_eq!(ro.get(b"base:12345678").unwrap(), Some(b"acme".to_vec()));
    }

    #[test]
    fn garbage_collection_is_harmless_on_a_live_store() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::create(dir.path()).unwrap();
        kv.write_chunk(&[staged("base:1", b"x")]).unwrap();
        kv.collect_garbage();
        assert_eq!(kv.get(b"base:1").unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn chunker_flushes_partial_chunk_on_close() {
        let (row_tx, row_rx) = mpsc::channel(16);
        let (chunk_tx, mut chunk_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let lookups = Arc::new(Lookups::empty());
        let chunker = tokio::spawn(chunk_rows(
            SourceKind::Base,
            lookups,
            row_rx,
            chunk_tx,
            cancel,
        ));
        row_tx
            .send(vec!["12345678".to_string(), "ACME".to_string()])
            .await
            .unwrap();
        drop(row_tx);
        chunker.await.unwrap().unwrap();
        let chunk = chunk_rx.recv().await.unwrap();
        assert_eq!(chunk.len(), 1);
        assert!(chunk_rx.recv().await.is_none());
    }
}
