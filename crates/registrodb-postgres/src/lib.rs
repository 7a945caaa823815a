//! PostgreSQL target for the registry pipeline.
//!
//! The pipeline writes either a single JSONB document per venue (fast bulk
//! `COPY` path, no upsert) or scalar columns into a `business` table with a
//! `socios_cnpj` child table for partners (upsert path, safe to re-run).
//!
//! Everything here uses runtime queries (`sqlx::query`) rather than the
//! compile-time macros so the crate builds without a `DATABASE_URL`.
//!
//! ## Tables
//!
//! | Mode | Tables |
//! |------|--------|
//! | JSON | `cnpj(cursor, national_id, json)` |
//! | Structured | `business(...)`, `socios_cnpj(...)` |
//! | Both | `meta(key, value)` |
//!
//! Bulk-load hints (`SET UNLOGGED`, autovacuum toggles, `VACUUM`/`ANALYZE`)
//! are advisory: a failure is logged and the load continues.

pub mod error;
pub mod partners;
pub mod schema;
pub mod writer;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub use error::{DbError, Result};
pub use writer::BatchWriter;

/// Longest key accepted by the `meta` table.
const META_KEY_MAX_LEN: usize = 16;

/// Validate a string that will be interpolated into SQL as an identifier.
///
/// Only lowercase ASCII letters, digits and underscores are accepted, which
/// covers every schema, table and index name this crate generates.
fn check_identifier(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Connection handle plus schema namespace for the output database.
#[derive(Clone)]
pub struct PostgresWriter {
    pool: PgPool,
    schema: String,
}

impl PostgresWriter {
    /// Connect and ping. The pool is sized for the batch-writer fan-out:
    /// each concurrent batch checks a connection out for one transaction.
    pub async fn connect(uri: &str, schema: &str) -> Result<Self> {
        check_identifier(schema)?;
        let pool = PgPoolOptions::new()
            .max_connections(128)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(5 * 60))
            .max_lifetime(Duration::from_secs(30 * 60))
            .connect(uri)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    /// Wrap an existing pool (tests, callers that manage their own pool).
    pub fn with_pool(pool: PgPool, schema: &str) -> Result<Self> {
        check_identifier(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// `schema.table` in dot notation.
    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create the output tables for the selected mode plus the `meta` table.
    pub async fn create_schema(&self, structured: bool) -> Result<()> {
        tracing::info!(schema = %self.schema, structured, "creating output tables");
        for stmt in schema::create_statements(&self.schema, structured) {
            sqlx::query(&stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Drop the output tables created by [`Self::create_schema`].
    pub async fn drop_schema(&self, structured: bool) -> Result<()> {
        tracing::info!(schema = %self.schema, structured, "dropping output tables");
        for stmt in schema::drop_statements(&self.schema, structured) {
            sqlx::query(&stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Run a statement whose failure must not abort the load.
    async fn exec_advisory(&self, sql: &str) {
        if let Err(e) = sqlx::query(sql).execute(&self.pool).await {
            tracing::warn!(sql, error = %e, "advisory statement failed, continuing");
        }
    }

    /// Bulk-load preparation: reclaim space, switch the involved tables to
    /// UNLOGGED (children before parents, the FK direction requires it) and
    /// disable autovacuum. Every step is advisory.
    pub async fn pre_load(&self, structured: bool) -> Result<()> {
        tracing::info!("preparing database for bulk load");
        self.exec_advisory("VACUUM").await;
        self.exec_advisory("ANALYZE").await;
        let tables: &[&str] = if structured {
            &["socios_cnpj", "business"]
        } else {
            &["cnpj"]
        };
        for t in tables {
            let t = self.table(t);
            self.exec_advisory(&format!("ALTER TABLE {t} SET UNLOGGED")).await;
            self.exec_advisory(&format!("ALTER TABLE {t} SET (autovacuum_enabled = false)"))
                .await;
        }
        Ok(())
    }

    /// Undo [`Self::pre_load`]: re-log in reverse order, re-enable
    /// autovacuum, then VACUUM/ANALYZE the loaded tables.
    pub async fn post_load(&self, structured: bool) -> Result<()> {
        tracing::info!("consolidating database after bulk load");
        let tables: &[&str] = if structured {
            &["business", "socios_cnpj"]
        } else {
            &["cnpj"]
        };
        for t in tables {
            let t = self.table(t);
            self.exec_advisory(&format!("ALTER TABLE {t} SET LOGGED")).await;
            self.exec_advisory(&format!("ALTER TABLE {t} SET (autovacuum_enabled = true)"))
                .await;
        }
        let list = tables
            .iter()
            .map(|t| self.table(t))
            .collect::<Vec<_>>()
            .join(", ");
        self.exec_advisory(&format!("VACUUM {list}")).await;
        self.exec_advisory(&format!("ANALYZE {list}")).await;
        Ok(())
    }

    /// Build the fixed list of secondary indexes for the output table.
    pub async fn create_extra_indexes(&self, structured: bool) -> Result<()> {
        let indexes = if structured {
            schema::structured_indexes(&self.schema)
        } else {
            schema::json_indexes(&self.schema)
        };
        for (name, stmt) in &indexes {
            check_identifier(name)?;
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        tracing::info!(count = indexes.len(), "secondary indexes created");
        Ok(())
    }

    /// Upsert a key/value pair into the `meta` table.
    pub async fn meta_save(&self, key: &str, value: &str) -> Result<()> {
        if key.len() > META_KEY_MAX_LEN {
            return Err(DbError::MetaKeyTooLong(key.to_string()));
        }
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            self.table("meta"),
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read a key from the `meta` table.
    pub async fn meta_read(&self, key: &str) -> Result<Option<String>> {
        let sql = format!("SELECT value FROM {} WHERE key = $1", self.table("meta"));
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }
}
