use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("key-value store error: {0}")]
    Kv(#[from] rocksdb::Error),

    #[error("value encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("database error: {0}")]
    Db(#[from] registrodb_postgres::DbError),

    #[error("no {kind} files found in {}", dir.display())]
    MissingSource { kind: &'static str, dir: PathBuf },

    #[error("malformed {kind} row: {reason}")]
    Row { kind: &'static str, reason: String },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("run canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, TransformError>;
