//! DDL for the output tables and the fixed secondary-index lists.

/// Statements that create the tables for the selected mode.
///
/// `meta` is created in both modes; the data-set "updated-at" stamp lives
/// there.
pub fn create_statements(schema: &str, structured: bool) -> Vec<String> {
    let mut stmts = Vec::new();
    if structured {
        stmts.push(format!(
            "CREATE TABLE IF NOT EXISTS {schema}.business (
                id BIGSERIAL PRIMARY KEY,
                national_id CHAR(14) NOT NULL UNIQUE,
                registered_name TEXT NOT NULL DEFAULT '',
                trade_name TEXT NOT NULL DEFAULT '',
                status_name TEXT NOT NULL DEFAULT '',
                primary_cnae TEXT NOT NULL DEFAULT '',
                primary_cnae_description TEXT NOT NULL DEFAULT '',
                secondary_cnaes_csv TEXT NOT NULL DEFAULT '',
                capital NUMERIC,
                legal_nature_code TEXT NOT NULL DEFAULT '',
                responsible_qualification TEXT NOT NULL DEFAULT '',
                size_code TEXT NOT NULL DEFAULT '',
                head_or_branch TEXT NOT NULL DEFAULT '',
                status_date DATE,
                status_reason_code TEXT NOT NULL DEFAULT '',
                activity_start_date DATE,
                email TEXT NOT NULL DEFAULT '',
                postal_code TEXT NOT NULL DEFAULT '',
                street_number TEXT NOT NULL DEFAULT '',
                street TEXT NOT NULL DEFAULT '',
                neighborhood TEXT NOT NULL DEFAULT '',
                municipality TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT '',
                street_type_code SMALLINT NOT NULL DEFAULT 0,
                complement TEXT NOT NULL DEFAULT '',
                phones_csv TEXT NOT NULL DEFAULT '',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ));
        stmts.push(format!(
            "CREATE TABLE IF NOT EXISTS {schema}.socios_cnpj (
                id BIGSERIAL PRIMARY KEY,
                business_id BIGINT NOT NULL REFERENCES {schema}.business (id),
                national_id CHAR(14) NOT NULL,
                partner_name TEXT NOT NULL,
                partner_tax_id VARCHAR(11),
                entry_date DATE,
                qualification TEXT NOT NULL DEFAULT '',
                UNIQUE (national_id, partner_name)
            )"
        ));
    } else {
        // Document mode is COPY-only (no upsert), so no unique constraint
        // stands in the way of the bulk path.
        stmts.push(format!(
            "CREATE TABLE IF NOT EXISTS {schema}.cnpj (
                cursor BIGSERIAL PRIMARY KEY,
                national_id CHAR(14) NOT NULL,
                json JSONB NOT NULL
            )"
        ));
    }
    stmts.push(format!(
        "CREATE TABLE IF NOT EXISTS {schema}.meta (
            key VARCHAR(16) PRIMARY KEY,
            value TEXT NOT NULL DEFAULT ''
        )"
    ));
    stmts
}

/// Statements that drop everything [`create_statements`] creates.
pub fn drop_statements(schema: &str, structured: bool) -> Vec<String> {
    let mut stmts = Vec::new();
    if structured {
        // Child before parent.
        stmts.push(format!("DROP TABLE IF EXISTS {schema}.socios_cnpj CASCADE"));
        stmts.push(format!("DROP TABLE IF EXISTS {schema}.business CASCADE"));
    } else {
        stmts.push(format!("DROP TABLE IF EXISTS {schema}.cnpj CASCADE"));
    }
    stmts.push(format!("DROP TABLE IF EXISTS {schema}.meta CASCADE"));
    stmts
}

/// Fixed secondary indexes for the structured tables.
pub fn structured_indexes(schema: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for col in [
        "primary_cnae",
        "municipality",
        "state",
        "legal_nature_code",
        "status_name",
    ] {
        let name = format!("business_{col}_idx");
        let stmt = format!("CREATE INDEX IF NOT EXISTS {name} ON {schema}.business ({col})");
        out.push((name, stmt));
    }
    // Left-prefix lookup used by the partners-only import.
    out.push((
        "business_national_id_prefix_idx".to_string(),
        format!(
            "CREATE INDEX IF NOT EXISTS business_national_id_prefix_idx \
             ON {schema}.business (LEFT(national_id, 8))"
        ),
    ));
    out
}

/// Fixed expression indexes over the JSONB document.
pub fn json_indexes(schema: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for field in ["primary_cnae", "municipality_code", "legal_nature_code"] {
        let name = format!("cnpj_{field}_idx");
        let stmt =
            format!("CREATE INDEX IF NOT EXISTS {name} ON {schema}.cnpj ((json->'{field}'))");
        out.push((name, stmt));
    }
    out.push((
        "cnpj_state_idx".to_string(),
        format!("CREATE INDEX IF NOT EXISTS cnpj_state_idx ON {schema}.cnpj ((json->>'state'))"),
    ));
    for (name, path) in [
        ("cnpj_secondary_cnae_codes_idx", "$.secondary_cnaes[*].code"),
        ("cnpj_partner_tax_ids_idx", "$.partners[*].tax_id"),
    ] {
        let stmt = format!(
            "CREATE INDEX IF NOT EXISTS {name} ON {schema}.cnpj \
             USING GIN (jsonb_path_query_array(json, '{path}'))"
        );
        out.push((name.to_string(), stmt));
    }
    out
}
