//! Batch writers for the two output modes.
//!
//! [`BatchWriter`] is the single entry point the pipeline fans batches into:
//!
//! - **JSON mode** streams one `(national_id, json)` row per company through
//!   PostgreSQL `COPY ... FROM STDIN`, the fastest load path (no upsert).
//! - **Structured mode** runs one transaction per batch with the three-step
//!   protocol: a multi-row upsert into `business` returning surrogate keys,
//!   a resolution query for rows the upsert did not return, then a multi-row
//!   insert into `socios_cnpj` that skips duplicates.
//!
//! Row-level problems (national ID that is not 14 digits, partner tax ID
//! longer than 11 digits) are logged and skipped; they never abort a batch.

use std::collections::HashMap;

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolCopyExt;
use sqlx::{PgPool, Row};

use registrodb_core::{cnpj, Company, Partner};

use crate::error::Result;
use crate::PostgresWriter;

/// Payload columns of the `business` table, in insert order.
const BUSINESS_COLUMNS: [&str; 25] = [
    "national_id",
    "registered_name",
    "trade_name",
    "status_name",
    "primary_cnae",
    "primary_cnae_description",
    "secondary_cnaes_csv",
    "capital",
    "legal_nature_code",
    "responsible_qualification",
    "size_code",
    "head_or_branch",
    "status_date",
    "status_reason_code",
    "activity_start_date",
    "email",
    "postal_code",
    "street_number",
    "street",
    "neighborhood",
    "municipality",
    "state",
    "street_type_code",
    "complement",
    "phones_csv",
];

/// Payload columns of the `socios_cnpj` table, in insert order.
const PARTNER_COLUMNS: [&str; 6] = [
    "business_id",
    "national_id",
    "partner_name",
    "partner_tax_id",
    "entry_date",
    "qualification",
];

/// Upper bound on rows per partner INSERT so bind counts stay well under
/// the protocol limit even when venues share a large partner board.
pub(crate) const PARTNER_INSERT_CHUNK: usize = 2000;

/// Output adapter: one of the two emission modes.
pub enum BatchWriter {
    Json(JsonCopyWriter),
    Structured(StructuredWriter),
}

impl BatchWriter {
    pub fn new(db: &PostgresWriter, structured: bool) -> Self {
        if structured {
            BatchWriter::Structured(StructuredWriter {
                pool: db.pool().clone(),
                schema: db.schema().to_string(),
            })
        } else {
            BatchWriter::Json(JsonCopyWriter {
                pool: db.pool().clone(),
                table: format!("{}.cnpj", db.schema()),
            })
        }
    }

    /// Persist one batch of enriched companies.
    pub async fn write_batch(&self, batch: &[Company]) -> Result<()> {
        match self {
            BatchWriter::Json(w) => w.write_batch(batch).await,
            BatchWriter::Structured(w) => w.write_batch(batch).await,
        }
    }
}

// ---------------------------------------------------------------------------
// JSON mode
// ---------------------------------------------------------------------------

/// Bulk `COPY` of serialized documents into the `cnpj` table.
pub struct JsonCopyWriter {
    pool: PgPool,
    table: String,
}

impl JsonCopyWriter {
    async fn write_batch(&self, batch: &[Company]) -> Result<()> {
        let mut payload = String::new();
        for company in batch {
            let id = cnpj::strip_non_digits(&company.national_id);
            if !cnpj::is_valid(&id) {
                tracing::warn!(national_id = %company.national_id, "skipping row with invalid national ID");
                continue;
            }
            let json = serde_json::to_string(company)?;
            payload.push_str(&copy_text_row(&[&id, &json]));
        }
        if payload.is_empty() {
            return Ok(());
        }
        let stmt = format!("COPY {} (national_id, json) FROM STDIN", self.table);
        let mut copy = self.pool.copy_in_raw(&stmt).await?;
        copy.send(payload.as_bytes()).await?;
        let rows = copy.finish().await?;
        tracing::debug!(rows, "copied batch");
        Ok(())
    }
}

/// Escape one field for the `COPY` text format.
fn copy_text_escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// One tab-separated `COPY` text row, newline terminated.
fn copy_text_row(fields: &[&str]) -> String {
    let mut row = fields
        .iter()
        .map(|f| copy_text_escape(f))
        .collect::<Vec<_>>()
        .join("\t");
    row.push('\n');
    row
}

// ---------------------------------------------------------------------------
// Structured mode
// ---------------------------------------------------------------------------

/// Upserting writer for the `business` / `socios_cnpj` tables.
pub struct StructuredWriter {
    pool: PgPool,
    schema: String,
}

/// A validated, database-ready projection of one [`Company`].
struct BusinessRow {
    national_id: String,
    registered_name: String,
    trade_name: String,
    status_name: String,
    primary_cnae: String,
    primary_cnae_description: String,
    secondary_cnaes_csv: String,
    capital: Option<BigDecimal>,
    legal_nature_code: String,
    responsible_qualification: String,
    size_code: String,
    head_or_branch: String,
    status_date: Option<NaiveDate>,
    status_reason_code: String,
    activity_start_date: Option<NaiveDate>,
    email: String,
    postal_code: String,
    street_number: String,
    street: String,
    neighborhood: String,
    municipality: String,
    state: String,
    street_type_code: i16,
    complement: String,
    phones_csv: String,
    partners: Vec<PartnerRow>,
}

pub(crate) struct PartnerRow {
    pub(crate) name: String,
    pub(crate) tax_id: Option<String>,
    pub(crate) entry_date: Option<NaiveDate>,
    pub(crate) qualification: String,
}

impl BusinessRow {
    /// Project and validate. `None` means the whole row is skipped.
    fn from_company(company: &Company) -> Option<Self> {
        let national_id = cnpj::strip_non_digits(&company.national_id);
        if !cnpj::is_valid(&national_id) {
            tracing::warn!(national_id = %company.national_id, "skipping row with invalid national ID");
            return None;
        }
        let mut postal_code = cnpj::strip_non_digits(&company.postal_code);
        postal_code.truncate(8);
        let partners = company
            .partners
            .iter()
            .filter_map(|p| PartnerRow::from_partner(&national_id, p))
            .collect();
        Some(Self {
            national_id,
            registered_name: company.registered_name.clone(),
            trade_name: company.trade_name.clone(),
            status_name: company.status_name.clone().unwrap_or_default(),
            primary_cnae: company
                .primary_cnae
                .map(|c| format!("{c:07}"))
                .unwrap_or_default(),
            primary_cnae_description: company.primary_cnae_description.clone().unwrap_or_default(),
            secondary_cnaes_csv: company.secondary_cnaes_csv(),
            capital: company.capital.clone(),
            legal_nature_code: company
                .legal_nature_code
                .map(|c| c.to_string())
                .unwrap_or_default(),
            responsible_qualification: company
                .responsible_qualification_code
                .map(|c| c.to_string())
                .unwrap_or_default(),
            size_code: company.size_code.map(|c| c.to_string()).unwrap_or_default(),
            head_or_branch: company
                .head_or_branch
                .clone()
                .unwrap_or_else(|| "MATRIZ".to_string()),
            status_date: company.status_date.map(Into::into),
            status_reason_code: company
                .status_reason_code
                .map(|c| c.to_string())
                .unwrap_or_default(),
            activity_start_date: company.activity_start_date.map(Into::into),
            email: company.email.clone().unwrap_or_default(),
            postal_code,
            street_number: company.number.clone(),
            street: company.street.clone(),
            neighborhood: company.neighborhood.clone(),
            municipality: company.municipality.clone().unwrap_or_default(),
            state: company.state.clone(),
            // The source carries street types as text only; the numeric
            // column stays at its default.
            street_type_code: 0,
            complement: company.complement.clone(),
            phones_csv: company.phones_csv(),
            partners,
        })
    }
}

impl PartnerRow {
    pub(crate) fn from_partner(national_id: &str, partner: &Partner) -> Option<Self> {
        if partner.name.is_empty() {
            return None;
        }
        let tax_id = match clean_partner_tax_id(partner.tax_id.as_deref().unwrap_or_default()) {
            Ok(tax_id) => tax_id,
            Err(digits) => {
                tracing::warn!(
                    national_id,
                    partner = %partner.name,
                    tax_id = %digits,
                    "skipping partner with over-long tax ID"
                );
                return None;
            }
        };
        Some(Self {
            name: partner.name.clone(),
            tax_id,
            entry_date: partner.entry_date.map(Into::into),
            qualification: partner.qualification.clone().unwrap_or_default(),
        })
    }
}

/// Normalize a partner tax ID.
///
/// Exactly 11 digits is a usable (possibly unmasked) ID; fewer digits
/// (masked IDs like `***220050**`) are stored as NULL. More than 11 digits
/// rejects the partner row, returning the digits for the caller's log line.
fn clean_partner_tax_id(raw: &str) -> std::result::Result<Option<String>, String> {
    let digits = cnpj::strip_non_digits(raw);
    match digits.len() {
        12.. => Err(digits),
        11 => Ok(Some(digits)),
        _ => Ok(None),
    }
}

/// Multi-row upsert into `business`, `RETURNING (id, national_id)`.
fn business_upsert_sql(schema: &str, rows: usize) -> String {
    let mut sql = format!(
        "INSERT INTO {schema}.business ({}) VALUES ",
        BUSINESS_COLUMNS.join(", ")
    );
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..BUSINESS_COLUMNS.len() {
            if col > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("${}", row * BUSINESS_COLUMNS.len() + col + 1));
        }
        sql.push(')');
    }
    sql.push_str(" ON CONFLICT (national_id) DO UPDATE SET ");
    let mut first = true;
    for col in BUSINESS_COLUMNS.iter().filter(|c| **c != "national_id") {
        if !first {
            sql.push_str(", ");
        }
        first = false;
        sql.push_str(&format!("{col} = EXCLUDED.{col}"));
    }
    sql.push_str(", updated_at = now() RETURNING id, national_id");
    sql
}

/// Multi-row insert into `socios_cnpj` that skips duplicates.
pub(crate) fn partners_insert_sql(schema: &str, rows: usize) -> String {
    let mut sql = format!(
        "INSERT INTO {schema}.socios_cnpj ({}) VALUES ",
        PARTNER_COLUMNS.join(", ")
    );
    for row in 0..rows {
        if row > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for col in 0..PARTNER_COLUMNS.len() {
            if col > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("${}", row * PARTNER_COLUMNS.len() + col + 1));
        }
        sql.push(')');
    }
    sql.push_str(" ON CONFLICT (national_id, partner_name) DO NOTHING");
    sql
}

impl StructuredWriter {
    async fn write_batch(&self, batch: &[Company]) -> Result<()> {
        // Project, validate and de-duplicate by national ID (final writer
        // wins) so the upsert never touches the same row twice in one
        // statement.
        let mut rows: Vec<BusinessRow> = Vec::with_capacity(batch.len());
        let mut by_id: HashMap<String, usize> = HashMap::with_capacity(batch.len());
        for company in batch {
            if let Some(row) = BusinessRow::from_company(company) {
                match by_id.get(&row.national_id) {
                    Some(&idx) => rows[idx] = row,
                    None => {
                        by_id.insert(row.national_id.clone(), rows.len());
                        rows.push(row);
                    }
                }
            }
        }
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        // Bulk-load hints; a refusal is advisory.
        for hint in ["SET LOCAL synchronous_commit = OFF", "SET LOCAL work_mem = '256MB'"] {
            if let Err(e) = sqlx::query(hint).execute(&mut *tx).await {
                tracing::warn!(hint, error = %e, "could not apply transaction hint");
            }
        }

        // Step 1: upsert venues, collecting surrogate keys.
        let sql = business_upsert_sql(&self.schema, rows.len());
        let mut query = sqlx::query(&sql);
        for row in &rows {
            query = query
                .bind(&row.national_id)
                .bind(&row.registered_name)
                .bind(&row.trade_name)
                .bind(&row.status_name)
                .bind(&row.primary_cnae)
                .bind(&row.primary_cnae_description)
                .bind(&row.secondary_cnaes_csv)
                .bind(&row.capital)
                .bind(&row.legal_nature_code)
                .bind(&row.responsible_qualification)
                .bind(&row.size_code)
                .bind(&row.head_or_branch)
                .bind(row.status_date)
                .bind(&row.status_reason_code)
                .bind(row.activity_start_date)
                .bind(&row.email)
                .bind(&row.postal_code)
                .bind(&row.street_number)
                .bind(&row.street)
                .bind(&row.neighborhood)
                .bind(&row.municipality)
                .bind(&row.state)
                .bind(row.street_type_code)
                .bind(&row.complement)
                .bind(&row.phones_csv);
        }
        let returned = query.fetch_all(&mut *tx).await?;
        let mut surrogate: HashMap<String, i64> = returned
            .iter()
            .map(|r| {
                (
                    r.get::<String, _>("national_id").trim().to_string(),
                    r.get::<i64, _>("id"),
                )
            })
            .collect();

        // Step 2: resolve any national ID the upsert did not return.
        let missing: Vec<String> = rows
            .iter()
            .filter(|r| !surrogate.contains_key(&r.national_id))
            .map(|r| r.national_id.clone())
            .collect();
        if !missing.is_empty() {
            let sql = format!(
                "SELECT id, national_id FROM {}.business WHERE national_id = ANY($1)",
                self.schema
            );
            let found = sqlx::query(&sql).bind(&missing).fetch_all(&mut *tx).await?;
            for r in &found {
                surrogate.insert(
                    r.get::<String, _>("national_id").trim().to_string(),
                    r.get::<i64, _>("id"),
                );
            }
        }

        // Step 3: insert partners against the surrogate keys.
        let mut partner_rows: Vec<(i64, &str, &PartnerRow)> = Vec::new();
        for row in &rows {
            let Some(&business_id) = surrogate.get(&row.national_id) else {
                tracing::warn!(national_id = %row.national_id, "no surrogate key for venue, skipping its partners");
                continue;
            };
            for partner in &row.partners {
                partner_rows.push((business_id, row.national_id.as_str(), partner));
            }
        }
        for chunk in partner_rows.chunks(PARTNER_INSERT_CHUNK) {
            let sql = partners_insert_sql(&self.schema, chunk.len());
            let mut query = sqlx::query(&sql);
            for (business_id, national_id, partner) in chunk {
                query = query
                    .bind(business_id)
                    .bind(*national_id)
                    .bind(&partner.name)
                    .bind(&partner.tax_id)
                    .bind(partner.entry_date)
                    .bind(&partner.qualification);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registrodb_core::RegistryDate;

    fn company(id: &str) -> Company {
        Company {
            national_id: id.to_string(),
            registered_name: "ACME LTDA".to_string(),
            ..Company::default()
        }
    }

    // -- COPY text format --

    #[test]
    fn copy_escape_handles_control_characters() {
        assert_eq!(copy_text_escape("plain"), "plain");
        assert_eq!(copy_text_escape("a\tb"), "a\\tb");
        assert_eq!(copy_text_escape("a\nb\rc"), "a\\nb\\rc");
        assert_eq!(copy_text_escape("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn copy_row_is_tab_separated_and_terminated() {
        assert_eq!(copy_text_row(&["12345678000199", "{}"]), "12345678000199\t{}\n");
    }

    // -- SQL generation --

    #[test]
    fn business_upsert_sql_single_row() {
        let sql = business_upsert_sql("public", 1);
        assert!(sql.starts_with("INSERT INTO public.business (national_id, "));
        assert!(sql.contains("VALUES ($1, $2"));
        assert!(sql.contains(&format!("${}", BUSINESS_COLUMNS.len())));
        assert!(sql.contains("ON CONFLICT (national_id) DO UPDATE SET"));
        assert!(sql.contains("registered_name = EXCLUDED.registered_name"));
        assert!(!sql.contains("national_id = EXCLUDED.national_id"));
        assert!(sql.contains("updated_at = now()"));
        assert!(sql.ends_with("RETURNING id, national_id"));
    }

    #[test]
    fn business_upsert_sql_numbers_rows_consecutively() {
        let sql = business_upsert_sql("public", 2);
        let n = BUSINESS_COLUMNS.len();
        assert!(sql.contains(&format!("(${}", n + 1)));
        assert!(sql.contains(&format!("${})", 2 * n)));
    }

    #[test]
    fn partners_insert_sql_skips_duplicates() {
        let sql = partners_insert_sql("public", 3);
        assert!(sql.contains("INSERT INTO public.socios_cnpj"));
        assert!(sql.contains("($13, $14, $15, $16, $17, $18)"));
        assert!(sql.ends_with("ON CONFLICT (national_id, partner_name) DO NOTHING"));
    }

    // -- validation --

    #[test]
    fn business_row_rejects_bad_national_id() {
        assert!(BusinessRow::from_company(&company("123")).is_none());
        assert!(BusinessRow::from_company(&company("12345678000199x9")).is_none());
        // Mask characters are stripped before the length check.
        let row = BusinessRow::from_company(&company("12.345.678/0001-99")).unwrap();
        assert_eq!(row.national_id, "12345678000199");
    }

    #[test]
    fn business_row_formats_scalar_fields() {
        let mut c = company("12345678000199");
        c.primary_cnae = Some(41204);
        c.postal_code = "01.310-100x".to_string();
        c.head_or_branch = None;
        let row = BusinessRow::from_company(&c).unwrap();
        assert_eq!(row.primary_cnae, "0041204");
        assert_eq!(row.postal_code, "01310100");
        assert_eq!(row.head_or_branch, "MATRIZ");
    }

    #[test]
    fn partner_tax_id_rules() {
        assert_eq!(clean_partner_tax_id("12345678901"), Ok(Some("12345678901".to_string())));
        assert_eq!(clean_partner_tax_id("***220050**"), Ok(None));
        assert_eq!(clean_partner_tax_id(""), Ok(None));
        assert_eq!(clean_partner_tax_id("123456789012"), Err("123456789012".to_string()));
    }

    #[test]
    fn over_long_tax_id_skips_partner_not_company() {
        let mut c = company("12345678000199");
        c.partners = vec![
            Partner {
                name: "ALICE".to_string(),
                tax_id: Some("123456789012345".to_string()),
                ..Partner::default()
            },
            Partner {
                name: "BOB".to_string(),
                tax_id: Some("12345678901".to_string()),
                entry_date: RegistryDate::parse("20200101"),
                ..Partner::default()
            },
        ];
        let row = BusinessRow::from_company(&c).unwrap();
        assert_eq!(row.partners.len(), 1);
        assert_eq!(row.partners[0].name, "BOB");
        assert_eq!(row.partners[0].tax_id.as_deref(), Some("12345678901"));
    }

    #[test]
    fn unnamed_partner_is_dropped() {
        let mut c = company("12345678000199");
        c.partners = vec![Partner::default()];
        let row = BusinessRow::from_company(&c).unwrap();
        assert!(row.partners.is_empty());
    }
}
