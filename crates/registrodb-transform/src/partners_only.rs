//! Partners-only ingestion.
//!
//! Re-imports partner rows into an existing venue table without staging:
//! rows are grouped by the base ID in the source, batched at roughly 5 000
//! partners, and each batch resolves its base IDs to venue surrogate keys
//! before an `ON CONFLICT DO NOTHING` insert.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indicatif::ProgressBar;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use registrodb_core::Partner;
use registrodb_postgres::PostgresWriter;

use crate::config::TransformConfig;
use crate::error::{Result, TransformError};
use crate::kv::progress_style;
use crate::lookups::Lookups;
use crate::rows::decode_partner;
use crate::source::{Source, SourceKind};

/// Partners (not groups) per database batch.
const PARTNER_BATCH_SIZE: usize = 5000;

/// Cap on concurrent import workers.
const MAX_IMPORT_WORKERS: usize = 10;

/// A partner source row carries 11 columns.
const PARTNER_ROW_LEN: usize = 11;

const PROGRESS_LOG_EVERY: u64 = 10_000;

type PartnerBatch = HashMap<String, Vec<Partner>>;

pub(crate) async fn run(
    dir: &Path,
    db: &PostgresWriter,
    lookups: Arc<Lookups>,
    config: &TransformConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let source = Source::open(dir, SourceKind::Partners)?;
    tracing::info!(
        estimated_rows = source.total_rows(),
        "starting partners-only import"
    );
    db.ensure_partner_lookup_index().await?;

    let workers = config.max_parallel_db_queries.clamp(1, MAX_IMPORT_WORKERS);
    let bar = ProgressBar::new(source.total_rows());
    bar.set_style(progress_style());
    bar.set_message("Importing partners");

    let (row_tx, row_rx) = mpsc::channel::<Vec<String>>(1000);
    let reader = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || source.send_to(&cancel, &row_tx))
    };

    let (batch_tx, batch_rx) = mpsc::channel::<PartnerBatch>(workers * 2);
    let grouper = tokio::spawn(group_rows(
        lookups,
        row_rx,
        batch_tx,
        bar.clone(),
        cancel.clone(),
    ));

    let processed = Arc::new(AtomicU64::new(0));
    let batch_rx = Arc::new(Mutex::new(batch_rx));
    let mut import_handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let db = db.clone();
        let batch_rx = batch_rx.clone();
        let bar = bar.clone();
        let cancel = cancel.clone();
        let processed = processed.clone();
        import_handles.push(tokio::spawn(async move {
            loop {
                let batch = batch_rx.lock().await.recv().await;
                let Some(batch) = batch else {
                    return Ok(());
                };
                let rows: u64 = batch.values().map(|p| p.len() as u64).sum();
                if let Err(e) = db.import_partners_batch(&batch).await {
                    cancel.cancel();
                    return Err(TransformError::from(e));
                }
                bar.inc(rows);
                let before = processed.fetch_add(rows, Ordering::Relaxed);
                if (before + rows) / PROGRESS_LOG_EVERY > before / PROGRESS_LOG_EVERY {
                    tracing::info!(processed = before + rows, "partner rows imported");
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
    note(grouper.await.map_err(TransformError::from).and_then(|r| r));
    for handle in import_handles {
        note(handle.await.map_err(TransformError::from).and_then(|r| r));
    }
    bar.finish_and_clear();

    if let Some(e) = first_error {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(TransformError::Canceled);
    }
    tracing::info!(
        processed = processed.load(Ordering::Relaxed),
        "partners-only import finished"
    );
    Ok(())
}

/// Group decoded partners by their source ID into ~5 000-partner batches.
async fn group_rows(
    lookups: Arc<Lookups>,
    mut row_rx: mpsc::Receiver<Vec<String>>,
    batch_tx: mpsc::Sender<PartnerBatch>,
    bar: ProgressBar,
    cancel: CancellationToken,
) -> Result<()> {
    let mut batch: PartnerBatch = HashMap::new();
    let mut pending = 0usize;
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
                    if row.len() < PARTNER_ROW_LEN {
                        bar.inc(1);
                        continue;
                    }
                    let partner = decode_partner(&lookups, &row);
                    batch.entry(row[0].trim().to_string()).or_default().push(partner);
                    pending += 1;
                    if pending >= PARTNER_BATCH_SIZE {
                        if batch_tx.send(std::mem::take(&mut batch)).await.is_err() {
                            return Ok(());
                        }
                        pending = 0;
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
