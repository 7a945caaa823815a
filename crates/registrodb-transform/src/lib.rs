//! Two-phase transform engine for the Brazilian company registry.
//!
//! The registry ships as a multi-gigabyte bundle of semicolon-delimited
//! Latin-1 CSV extracts. [`transform`] turns it into one database record per
//! venue in two phases:
//!
//! 1. **Staging**: every auxiliary stream (bases, partners, Simples/MEI,
//!    four tax-regime streams) is materialized into a temporary embedded
//!    key-value store, keyed so one venue's enrichment data is a handful of
//!    point reads and prefix scans ([`kv`]).
//! 2. **Join and persist**: the venue stream is decoded, enriched against
//!    the store and batch-written to PostgreSQL with bounded concurrency
//!    ([`enrich`], `venues`). Writes are upserts on the national ID, so a
//!    failed run can simply be re-run.
//!
//! [`transform_partners_only`] is the narrower path that re-imports partner
//! rows into an existing venue table without staging.
//!
//! The staging directory lives under a [`tempfile::TempDir`] owned by the
//! orchestrator and is removed on every exit path, including panics. A
//! SIGINT cancels the shared token; workers finish their in-flight
//! transaction and wind down.

pub mod config;
pub mod enrich;
pub mod error;
pub mod kv;
pub mod lookups;
pub mod rows;
pub mod source;

mod partners_only;
mod venues;

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use registrodb_postgres::{BatchWriter, PostgresWriter};

pub use config::{TransformConfig, BATCH_SIZE, MAX_PARALLEL_DB_QUERIES, MAX_PARALLEL_KV_WRITES};
pub use error::{Result, TransformError};
pub use kv::KvStore;
pub use lookups::Lookups;

/// Sidecar file the downloader leaves next to the CSVs with the data set's
/// publication stamp.
pub const DATASET_UPDATED_AT_FILE: &str = "updated_at.txt";

/// Run the full two-phase transform against `dir`.
pub async fn transform(dir: &Path, db: &PostgresWriter, config: &TransformConfig) -> Result<()> {
    let temp = tempfile::Builder::new().prefix("registrodb-").tempdir()?;
    tracing::info!(path = %temp.path().display(), "created temporary key-value directory");
    let cancel = CancellationToken::new();
    let sigint = spawn_sigint_watcher(cancel.clone());

    let result = run_phases(dir, db, config, temp.path(), &cancel).await;

    sigint.abort();
    let staging_path = temp.path().display().to_string();
    if let Err(e) = temp.close() {
        tracing::error!(path = %staging_path, error = %e, "could not remove temporary directory");
    } else {
        tracing::info!(path = %staging_path, "temporary directory removed");
    }
    result
}

async fn run_phases(
    dir: &Path,
    db: &PostgresWriter,
    config: &TransformConfig,
    kv_path: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let lookups = Arc::new(Lookups::load(dir)?);

    // Phase A. The writer handle closes at the end of the block so the
    // read-only reopen below sees a quiesced store.
    {
        let kv = Arc::new(KvStore::create(kv_path)?);
        kv::stage_all(
            dir,
            kv,
            lookups.clone(),
            config.max_parallel_kv_writes,
            cancel,
        )
        .await?;
    }

    if config.clean_up {
        db.drop_schema(config.structured).await?;
    }
    db.create_schema(config.structured).await?;
    db.pre_load(config.structured).await?;

    // Phase B.
    let kv = Arc::new(KvStore::open_read_only(kv_path)?);
    let writer = Arc::new(BatchWriter::new(db, config.structured));
    venues::run(dir, kv, lookups, writer, config, cancel).await?;

    db.post_load(config.structured).await?;
    db.create_extra_indexes(config.structured).await?;
    save_updated_at(db, dir).await?;
    Ok(())
}

/// Import only partner rows into an existing venue table.
pub async fn transform_partners_only(
    dir: &Path,
    db: &PostgresWriter,
    config: &TransformConfig,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let sigint = spawn_sigint_watcher(cancel.clone());
    let lookups = Arc::new(Lookups::load(dir)?);
    let result = partners_only::run(dir, db, lookups, config, &cancel).await;
    sigint.abort();
    result?;
    // The import itself succeeded; a missing stamp is not worth failing for.
    if let Err(e) = save_updated_at(db, dir).await {
        tracing::warn!(error = %e, "could not save the updated-at stamp");
    }
    Ok(())
}

/// Stamp the `meta` table with the sidecar's publication date.
async fn save_updated_at(db: &PostgresWriter, dir: &Path) -> Result<()> {
    let path = dir.join(DATASET_UPDATED_AT_FILE);
    let value = std::fs::read_to_string(&path)?;
    tracing::info!("saving the updated-at date to the database");
    db.meta_save("updated-at", value.trim()).await?;
    Ok(())
}

fn spawn_sigint_watcher(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, canceling the run");
            cancel.cancel();
        }
    })
}
