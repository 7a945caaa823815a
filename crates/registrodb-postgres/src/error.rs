use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata keys are limited to 16 characters: {0:?}")]
    MetaKeyTooLong(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
