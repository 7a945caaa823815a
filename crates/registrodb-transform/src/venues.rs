//! Phase B: stream venues, join against the staged store, persist.
//!
//! One reader drains the venue files into a bounded row channel; an
//! assembler decodes and enriches each row and groups the results into
//! batches; a pool of writer workers drains the batch channel, one database
//! transaction per batch. The first error anywhere cancels the run.

use std::path::Path;
use std::sync::Arc;

use indicatif::ProgressBar;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use registrodb_core::Company;
use registrodb_postgres::BatchWriter;

use crate::config::TransformConfig;
use crate::enrich::enrich_company;
use crate::error::{Result, TransformError};
use crate::kv::{progress_style, KvStore};
use crate::lookups::Lookups;
use crate::rows::decode_venue;
use crate::source::{Source, SourceKind};

const ROW_CHANNEL_CAPACITY: usize = 1000;

pub(crate) async fn run(
    dir: &Path,
    kv: Arc<KvStore>,
    lookups: Arc<Lookups>,
    writer: Arc<BatchWriter>,
    config: &TransformConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let source = Source::open(dir, SourceKind::Venues)?;
    let workers = config.max_parallel_db_queries.max(1);
    let batch_size = config.batch_size.max(1);

    let bar = ProgressBar::new(source.total_rows());
    bar.set_style(progress_style());
    bar.set_message("Writing venues to the database");

    let (row_tx, row_rx) = mpsc::channel::<Vec<String>>(ROW_CHANNEL_CAPACITY);
    let reader = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || source.send_to(&cancel, &row_tx))
    };

    let (batch_tx, batch_rx) = mpsc::channel::<Vec<Company>>(workers * 2);
    let assembler = tokio::spawn(assemble_batches(
        kv,
        lookups,
        row_rx,
        batch_tx,
        batch_size,
        config.privacy,
        cancel.clone(),
    ));

    let batch_rx = Arc::new(Mutex::new(batch_rx));
    let mut writer_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let writer = writer.clone();
        let batch_rx = batch_rx.clone();
        let bar = bar.clone();
        let cancel = cancel.clone();
        writer_handles.push(tokio::spawn(async move {
            loop {
                let batch = batch_rx.lock().await.recv().await;
                let Some(batch) = batch else {
                    return Ok(());
                };
                if let Err(e) = writer.write_batch(&batch).await {
                    cancel.cancel();
                    return Err(TransformError::from(e));
                }
                bar.inc(batch.len() as u64);
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
    note(assembler.await.map_err(TransformError::from).and_then(|r| r));
    for handle in writer_handles {
        note(handle.await.map_err(TransformError::from).and_then(|r| r));
    }
    bar.finish_and_clear();

    if let Some(e) = first_error {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(TransformError::Canceled);
    }
    Ok(())
}

/// Decode, enrich and group rows into batches of `batch_size`.
async fn assemble_batches(
    kv: Arc<KvStore>,
    lookups: Arc<Lookups>,
    mut row_rx: mpsc::Receiver<Vec<String>>,
    batch_tx: mpsc::Sender<Vec<Company>>,
    batch_size: usize,
    privacy: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if !batch.is_empty() {
                    let _ = batch_tx.send(batch).await;
                }
                return Ok(());
            }
            row = row_rx.recv() => match row {
                Some(row) => {
                    let seeded = decode_venue(&lookups, &row);
                    let company = match enrich_company(&kv, seeded, privacy).await {
                        Ok(company) => company,
                        Err(e) => {
                            cancel.cancel();
                            return Err(e);
                        }
                    };
                    batch.push(company);
                    if batch.len() >= batch_size {
                        let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        if batch_tx.send(full).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                None => {
                    if !batch.is_empty() {
                        let _ = batch_tx.send(batch).await;
                    }
                    return Ok(());
                }
            }
        }
    }
}
