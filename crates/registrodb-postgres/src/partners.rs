//! Batched partners-only import.
//!
//! Re-imports partner rows into an existing `business` table. Each batch
//! groups partners by the ID found in the source (an 8-digit base or a full
//! 14-digit national ID), resolves every ID to venue surrogate keys in two
//! queries, then inserts with `ON CONFLICT DO NOTHING`. An 8-digit base that
//! matches several venues attaches the partners to each of them.

use std::collections::HashMap;

use sqlx::Row;

use registrodb_core::{cnpj, Partner};

use crate::error::Result;
use crate::writer::{partners_insert_sql, PartnerRow, PARTNER_INSERT_CHUNK};
use crate::PostgresWriter;

/// IDs from one batch, split by how they resolve to venues.
fn partition_keys<'a>(keys: impl Iterator<Item = &'a String>) -> (Vec<String>, Vec<String>) {
    let mut bases = Vec::new();
    let mut full_ids = Vec::new();
    for key in keys {
        let digits = cnpj::strip_non_digits(key);
        match digits.len() {
            8 => bases.push(digits),
            14 => full_ids.push(digits),
            _ => {
                tracing::warn!(key = %key, "skipping partner group with unusable ID");
            }
        }
    }
    (bases, full_ids)
}

impl PostgresWriter {
    /// Create the left-prefix lookup index the base-ID resolution relies on,
    /// if it is not there yet.
    pub async fn ensure_partner_lookup_index(&self) -> Result<()> {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS business_national_id_prefix_idx \
             ON {}.business (LEFT(national_id, 8))",
            self.schema()
        );
        sqlx::query(&sql).execute(self.pool()).await?;
        Ok(())
    }

    /// Insert one batch of partner groups keyed by base or national ID.
    ///
    /// Returns the number of partner rows actually inserted (conflicts with
    /// already-present `(national_id, partner_name)` pairs count as zero).
    pub async fn import_partners_batch(
        &self,
        batch: &HashMap<String, Vec<Partner>>,
    ) -> Result<u64> {
        let (bases, full_ids) = partition_keys(batch.keys());

        let mut tx = self.pool().begin().await?;

        // Resolve surrogate keys: one query per key shape.
        let mut venues: HashMap<String, Vec<(i64, String)>> = HashMap::new();
        if !bases.is_empty() {
            let sql = format!(
                "SELECT id, national_id FROM {}.business WHERE LEFT(national_id, 8) = ANY($1)",
                self.schema()
            );
            for row in sqlx::query(&sql).bind(&bases).fetch_all(&mut *tx).await? {
                let national_id = row.get::<String, _>("national_id").trim().to_string();
                venues
                    .entry(cnpj::base(&national_id).to_string())
                    .or_default()
                    .push((row.get("id"), national_id));
            }
        }
        if !full_ids.is_empty() {
            let sql = format!(
                "SELECT id, national_id FROM {}.business WHERE national_id = ANY($1)",
                self.schema()
            );
            for row in sqlx::query(&sql).bind(&full_ids).fetch_all(&mut *tx).await? {
                let national_id = row.get::<String, _>("national_id").trim().to_string();
                venues
                    .entry(national_id.clone())
                    .or_default()
                    .push((row.get("id"), national_id));
            }
        }

        // Expand groups into concrete partner rows.
        let mut rows: Vec<(i64, String, PartnerRow)> = Vec::new();
        for (key, partners) in batch {
            let digits = cnpj::strip_non_digits(key);
            let Some(matched) = venues.get(&digits) else {
                tracing::debug!(key = %key, "no venue for partner group");
                continue;
            };
            for (business_id, national_id) in matched {
                for partner in partners {
                    if let Some(row) = PartnerRow::from_partner(national_id, partner) {
                        rows.push((*business_id, national_id.clone(), row));
                    }
                }
            }
        }

        let mut inserted = 0u64;
        for chunk in rows.chunks(PARTNER_INSERT_CHUNK) {
            let sql = partners_insert_sql(self.schema(), chunk.len());
            let mut query = sqlx::query(&sql);
            for (business_id, national_id, partner) in chunk {
                query = query
                    .bind(business_id)
                    .bind(national_id)
                    .bind(&partner.name)
                    .bind(&partner.tax_id)
                    .bind(partner.entry_date)
                    .bind(&partner.qualification);
            }
            inserted += query.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}
