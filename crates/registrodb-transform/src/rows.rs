//! Per-kind row decoders and the stage-key schema.
//!
//! Each staged source kind decodes into a typed record plus the key it is
//! stored under:
//!
//! | Kind | Key |
//! |------|-----|
//! | base | `base:<base8>` |
//! | partner | `partner:<base8>:<md5>` |
//! | simple-taxes | `simple:<base8>:<md5>` |
//! | tax regimes (4 streams) | `regime:<id14>:<md5>` |
//!
//! The `<md5>` suffix is the hex digest of the row's concatenated fields, so
//! several rows for the same ID coexist in the store; the base kind has one
//! row per ID and no suffix. Values are bincode-encoded records, which keeps
//! the on-disk form deterministic.

use bigdecimal::BigDecimal;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use registrodb_core::{Cnae, Company, Partner, RegistryDate, SimpleTaxStatus, TaxRegimes};

use crate::error::{Result, TransformError};
use crate::lookups::{
    age_range_name, head_or_branch_name, partner_identification_name, size_name, status_name,
    Lookups,
};
use crate::source::SourceKind;

/// The legal entity's base registration, staged once per base ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseRecord {
    pub registered_name: String,
    pub legal_nature_code: Option<i32>,
    pub legal_nature: Option<String>,
    pub responsible_qualification_code: Option<i32>,
    pub responsible_qualification: Option<String>,
    pub size_code: Option<i32>,
    pub size_name: Option<String>,
    pub capital: Option<BigDecimal>,
    pub federated_entity_responsible: String,
}

/// Which annual series a tax-regime row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeKind {
    RealProfit,
    PresumedProfit,
    ArbitratedProfit,
    Exempt,
}

/// One row of a tax-regime stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRegimeRecord {
    pub kind: RegimeKind,
    pub year: i32,
    pub taxation_form: String,
    pub bookkeeping_count: u32,
}

impl TaxRegimeRecord {
    /// Accumulate this row into the per-regime annual maps.
    pub fn fold_into(&self, regimes: &mut TaxRegimes) {
        let series = match self.kind {
            RegimeKind::RealProfit => &mut regimes.real_profit,
            RegimeKind::PresumedProfit => &mut regimes.presumed_profit,
            RegimeKind::ArbitratedProfit => &mut regimes.arbitrated_profit,
            RegimeKind::Exempt => &mut regimes.exempt,
        };
        series.insert(self.year, self.bookkeeping_count);
    }
}

/// A key/value pair ready for the stage store.
pub struct StagedRow {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

pub fn base_key(base: &str) -> String {
    format!("base:{base}")
}

pub fn partner_prefix(base: &str) -> String {
    format!("partner:{base}:")
}

pub fn simple_taxes_prefix(base: &str) -> String {
    format!("simple:{base}:")
}

pub fn regime_prefix(national_id: &str) -> String {
    format!("regime:{national_id}:")
}

/// Hex MD5 of the row's concatenated fields.
fn checksum(row: &[String]) -> String {
    let mut hasher = Md5::new();
    for field in row {
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn field(row: &[String], idx: usize) -> &str {
    row.get(idx).map(String::as_str).unwrap_or_default().trim()
}

fn opt_i32(s: &str) -> Option<i32> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse().ok()
}

/// `S` and `N` flags; anything else is "unknown".
fn opt_flag(s: &str) -> Option<bool> {
    match s.trim() {
        "S" | "s" => Some(true),
        "N" | "n" => Some(false),
        _ => None,
    }
}

/// Capital values use a comma as decimal separator; plain integers are
/// accepted as-is.
fn parse_capital(s: &str) -> Option<BigDecimal> {
    let s = s.trim().replace(',', ".");
    if s.is_empty() {
        return None;
    }
    s.parse().ok()
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Description for a code via a lookup table; `None` code stays `None`.
fn described(code: Option<i32>, lookup: impl Fn(i64) -> String) -> Option<String> {
    code.map(|c| lookup(c as i64))
}

/// Decode one row of a staged kind into its key/value pair.
///
/// The venue kind is not staged and is rejected here.
pub fn decode_staged(kind: SourceKind, lookups: &Lookups, row: &[String]) -> Result<StagedRow> {
    let (mut key, value) = match kind {
        SourceKind::Base => (
            base_key(field(row, 0)),
            bincode::serialize(&decode_base(lookups, row))?,
        ),
        SourceKind::Partners => (
            format!("partner:{}", field(row, 0)),
            bincode::serialize(&decode_partner(lookups, row))?,
        ),
        SourceKind::SimpleTaxes => (
            format!("simple:{}", field(row, 0)),
            bincode::serialize(&decode_simple_taxes(row))?,
        ),
        SourceKind::RealProfit
        | SourceKind::PresumedProfit
        | SourceKind::ArbitratedProfit
        | SourceKind::Exempt => (
            format!("regime:{}", field(row, 1)),
            bincode::serialize(&decode_tax_regime(kind, row)?)?,
        ),
        SourceKind::Venues => {
            return Err(TransformError::Row {
                kind: kind.label(),
                reason: "venues are not staged".to_string(),
            })
        }
    };
    if kind.is_accumulative() {
        key.push(':');
        key.push_str(&checksum(row));
    }
    Ok(StagedRow {
        key: key.into_bytes(),
        value,
    })
}

/// Base registration: name, legal nature, responsible qualification, size,
/// capital and the responsible federated entity.
pub fn decode_base(lookups: &Lookups, row: &[String]) -> BaseRecord {
    let legal_nature_code = opt_i32(field(row, 2));
    let responsible_qualification_code = opt_i32(field(row, 3));
    let size_code = opt_i32(field(row, 4));
    BaseRecord {
        registered_name: field(row, 1).to_string(),
        legal_nature_code,
        legal_nature: described(legal_nature_code, |c| lookups.legal_nature(c)),
        responsible_qualification_code,
        responsible_qualification: described(responsible_qualification_code, |c| {
            lookups.qualification(c)
        }),
        size_code,
        size_name: size_code.map(|c| size_name(c).to_string()),
        capital: parse_capital(field(row, 5)),
        federated_entity_responsible: field(row, 6).to_string(),
    }
}

/// Partner-board row.
pub fn decode_partner(lookups: &Lookups, row: &[String]) -> Partner {
    let identification_type = opt_i32(field(row, 1));
    let qualification_code = opt_i32(field(row, 4));
    let country_code = opt_i32(field(row, 6));
    let representative_qualification_code = opt_i32(field(row, 9));
    let age_range_code = opt_i32(field(row, 10));
    Partner {
        identification_type,
        identification_type_description: identification_type
            .map(|c| partner_identification_name(c).to_string()),
        name: field(row, 2).to_string(),
        tax_id: non_empty(field(row, 3)),
        qualification_code,
        qualification: described(qualification_code, |c| lookups.qualification(c)),
        entry_date: RegistryDate::parse(field(row, 5)),
        country_code,
        country: described(country_code, |c| lookups.country(c)),
        representative_tax_id: non_empty(field(row, 7)),
        representative_name: field(row, 8).to_string(),
        representative_qualification_code,
        representative_qualification: described(representative_qualification_code, |c| {
            lookups.qualification(c)
        }),
        age_range_code,
        age_range: age_range_code.map(|c| age_range_name(c).to_string()),
    }
}

/// Simples Nacional / MEI opt-in row.
pub fn decode_simple_taxes(row: &[String]) -> SimpleTaxStatus {
    SimpleTaxStatus {
        simple_opted_in: opt_flag(field(row, 1)),
        simple_entry_date: RegistryDate::parse(field(row, 2)),
        simple_exit_date: RegistryDate::parse(field(row, 3)),
        mei_opted_in: opt_flag(field(row, 4)),
        mei_entry_date: RegistryDate::parse(field(row, 5)),
        mei_exit_date: RegistryDate::parse(field(row, 6)),
    }
}

/// Tax-regime row. The four streams share one schema; the stream a row came
/// from is recorded so enrichment folds it into the right annual series.
pub fn decode_tax_regime(kind: SourceKind, row: &[String]) -> Result<TaxRegimeRecord> {
    let regime_kind = match kind {
        SourceKind::RealProfit => RegimeKind::RealProfit,
        SourceKind::PresumedProfit => RegimeKind::PresumedProfit,
        SourceKind::ArbitratedProfit => RegimeKind::ArbitratedProfit,
        SourceKind::Exempt => RegimeKind::Exempt,
        _ => {
            return Err(TransformError::Row {
                kind: kind.label(),
                reason: "not a tax-regime source".to_string(),
            })
        }
    };
    let year = opt_i32(field(row, 0)).ok_or_else(|| TransformError::Row {
        kind: kind.label(),
        reason: format!("unparsable year {:?}", field(row, 0)),
    })?;
    Ok(TaxRegimeRecord {
        kind: regime_kind,
        year,
        taxation_form: field(row, 3).to_string(),
        bookkeeping_count: field(row, 4).parse().unwrap_or(0),
    })
}

/// Seed a [`Company`] from one venue row. Base-registration fields stay at
/// their defaults until enrichment.
pub fn decode_venue(lookups: &Lookups, row: &[String]) -> Company {
    let national_id = format!("{}{}{}", field(row, 0), field(row, 1), field(row, 2));
    let head_or_branch_code = opt_i32(field(row, 3));
    let status_code = opt_i32(field(row, 5));
    let status_reason_code = opt_i32(field(row, 7));
    let country_code = opt_i32(field(row, 9));
    let primary_cnae = opt_i32(field(row, 11));
    let municipality_code = opt_i32(field(row, 20));
    Company {
        national_id,
        head_or_branch_code,
        head_or_branch: head_or_branch_code.map(|c| head_or_branch_name(c).to_string()),
        trade_name: field(row, 4).to_string(),
        status_code,
        status_name: status_code.map(|c| status_name(c).to_string()),
        status_date: RegistryDate::parse(field(row, 6)),
        status_reason_code,
        status_reason: described(status_reason_code, |c| lookups.reason(c)),
        city_abroad: field(row, 8).to_string(),
        country_code,
        country: described(country_code, |c| lookups.country(c)),
        activity_start_date: RegistryDate::parse(field(row, 10)),
        primary_cnae,
        primary_cnae_description: described(primary_cnae, |c| lookups.cnae(c)),
        secondary_cnaes: decode_secondary_cnaes(lookups, field(row, 12)),
        street_type: field(row, 13).to_string(),
        street: field(row, 14).to_string(),
        number: field(row, 15).to_string(),
        complement: field(row, 16).to_string(),
        neighborhood: field(row, 17).to_string(),
        postal_code: field(row, 18).to_string(),
        state: field(row, 19).to_string(),
        municipality_code,
        municipality: described(municipality_code, |c| lookups.municipality(c)),
        phone_1: merge_phone(field(row, 21), field(row, 22)),
        phone_2: merge_phone(field(row, 23), field(row, 24)),
        fax: merge_phone(field(row, 25), field(row, 26)),
        email: non_empty(field(row, 27)).map(|e| e.to_lowercase()),
        special_situation: field(row, 28).to_string(),
        special_situation_date: RegistryDate::parse(field(row, 29)),
        ..Company::default()
    }
}

/// Comma-separated secondary CNAE codes, each enriched with its
/// description.
fn decode_secondary_cnaes(lookups: &Lookups, raw: &str) -> Vec<Cnae> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i32>().ok())
        .map(|code| Cnae {
            code,
            description: lookups.cnae(code as i64),
        })
        .collect()
}

/// Area code and number concatenated; empty number means no phone.
fn merge_phone(area: &str, number: &str) -> String {
    if number.is_empty() {
        String::new()
    } else {
        format!("{area}{number}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    fn empty_lookups() -> Lookups {
        Lookups::empty()
    }

    // -- key schema --

    #[test]
    fn base_key_has_no_hash_suffix() {
        let staged =
            decode_staged(SourceKind::Base, &empty_lookups(), &row(&["12345678", "ACME"])).unwrap();
        assert_eq!(staged.key, b"base:12345678".to_vec());
    }

    #[test]
    fn accumulative_keys_carry_the_row_checksum() {
        let r = row(&["12345678", "2", "ALICE"]);
        let staged = decode_staged(SourceKind::Partners, &empty_lookups(), &r).unwrap();
        let key = String::from_utf8(staged.key).unwrap();
        let expected = format!("partner:12345678:{}", checksum(&r));
        assert_eq!(key, expected);
        // 32 hex chars after the second colon.
        assert_eq!(key.rsplit(':').next().unwrap().len(), 32);
    }

    #[test]
    fn identical_rows_share_a_key_and_distinct_rows_do_not() {
        let l = empty_lookups();
        let a = decode_staged(SourceKind::Partners, &l, &row(&["12345678", "2", "ALICE"])).unwrap();
        let b = decode_staged(SourceKind::Partners, &l, &row(&["12345678", "2", "ALICE"])).unwrap();
        let c = decode_staged(SourceKind::Partners, &l, &row(&["12345678", "2", "BOB"])).unwrap();
        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
    }

    #[test]
    fn regime_keys_use_the_full_national_id() {
        let r = row(&["2020", "33333333000144", "", "LUCRO REAL", "1"]);
        let staged = decode_staged(SourceKind::RealProfit, &empty_lookups(), &r).unwrap();
        assert!(String::from_utf8(staged.key)
            .unwrap()
            .starts_with("regime:33333333000144:"));
    }

    #[test]
    fn venues_are_not_staged() {
        let err = decode_staged(SourceKind::Venues, &empty_lookups(), &row(&[])).unwrap_err();
        assert!(matches!(err, TransformError::Row { .. }));
    }

    // -- decoders --

    #[test]
    fn base_row_decodes_name_codes_and_capital() {
        let r = row(&["12345678", "ACME LTDA", "2050", "41", "1", "100000,00", ""]);
        let base = decode_base(&empty_lookups(), &r);
        assert_eq!(base.registered_name, "ACME LTDA");
        assert_eq!(base.legal_nature_code, Some(2050));
        assert_eq!(base.responsible_qualification_code, Some(41));
        assert_eq!(base.size_code, Some(1));
        assert_eq!(base.size_name.as_deref(), Some("MICRO EMPRESA"));
        assert_eq!(base.capital, Some("100000.00".parse().unwrap()));
        assert_eq!(base.federated_entity_responsible, "");
    }

    #[test]
    fn capital_accepts_integer_input() {
        assert_eq!(parse_capital("100000"), Some("100000".parse().unwrap()));
        assert_eq!(parse_capital(""), None);
        assert_eq!(parse_capital("12,5"), Some("12.5".parse().unwrap()));
    }

    #[test]
    fn base_round_trips_through_the_stage_encoding() {
        let r = row(&["12345678", "ACME LTDA", "2050", "41", "1", "100000,00", ""]);
        let base = decode_base(&empty_lookups(), &r);
        let bytes = bincode::serialize(&base).unwrap();
        let back: BaseRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, base);
    }

    #[test]
    fn partner_row_decodes_with_fixed_and_table_lookups() {
        let r = row(&[
            "12345678",
            "2",
            "ALICE",
            "***220050**",
            "49",
            "20200101",
            "",
            "",
            "",
            "",
            "4",
        ]);
        let p = decode_partner(&empty_lookups(), &r);
        assert_eq!(p.identification_type, Some(2));
        assert_eq!(p.identification_type_description.as_deref(), Some("PESSOA FÍSICA"));
        assert_eq!(p.name, "ALICE");
        assert_eq!(p.tax_id.as_deref(), Some("***220050**"));
        assert_eq!(p.entry_date, RegistryDate::parse("20200101"));
        assert_eq!(p.age_range.as_deref(), Some("31 a 40 anos"));
        assert_eq!(p.country_code, None);
        assert_eq!(p.country, None);
    }

    #[test]
    fn partner_round_trips_through_the_stage_encoding() {
        let r = row(&["12345678", "1", "HOLDING SA", "11222333000181", "22", "19990315"]);
        let p = decode_partner(&empty_lookups(), &r);
        let back: Partner = bincode::deserialize(&bincode::serialize(&p).unwrap()).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn simple_taxes_flags_and_dates() {
        let r = row(&["12345678", "S", "20180701", "", "N", "", ""]);
        let s = decode_simple_taxes(&r);
        assert_eq!(s.simple_opted_in, Some(true));
        assert_eq!(s.simple_entry_date, RegistryDate::parse("20180701"));
        assert_eq!(s.simple_exit_date, None);
        assert_eq!(s.mei_opted_in, Some(false));

        let blank = decode_simple_taxes(&row(&["12345678", "", "", "", "", "", ""]));
        assert_eq!(blank.simple_opted_in, None);
    }

    #[test]
    fn tax_regime_requires_a_year() {
        let ok = decode_tax_regime(
            SourceKind::PresumedProfit,
            &row(&["2021", "33333333000144", "", "LUCRO PRESUMIDO", "2"]),
        )
        .unwrap();
        assert_eq!(ok.kind, RegimeKind::PresumedProfit);
        assert_eq!(ok.year, 2021);
        assert_eq!(ok.bookkeeping_count, 2);

        let err = decode_tax_regime(
            SourceKind::PresumedProfit,
            &row(&["", "33333333000144", "", "", ""]),
        );
        assert!(err.is_err());
    }

    #[test]
    fn tax_regimes_fold_into_their_own_series() {
        let mut regimes = TaxRegimes::default();
        for (year, count) in [(2020, 1u32), (2021, 3u32)] {
            TaxRegimeRecord {
                kind: RegimeKind::RealProfit,
                year,
                taxation_form: "LUCRO REAL".to_string(),
                bookkeeping_count: count,
            }
            .fold_into(&mut regimes);
        }
        assert_eq!(regimes.real_profit.get(&2020), Some(&1));
        assert_eq!(regimes.real_profit.get(&2021), Some(&3));
        assert!(regimes.presumed_profit.is_empty());
        assert!(regimes.exempt.is_empty());
    }

    #[test]
    fn venue_row_seeds_a_company() {
        let r = row(&[
            "12345678", "0001", "99", // national ID parts
            "1",                      // head office
            "ACME STORE",             // trade name
            "2", "20100115", "0",     // status, date, reason
            "", "",                   // abroad
            "20100115",               // activity start
            "4120400",                // primary CNAE
            "7732201,4399103",        // secondary CNAEs
            "AVENIDA", "PAULISTA", "1000", "SALA 1", "BELA VISTA",
            "01310100", "SP", "7107",
            "11", "33334444", "11", "55556666", "", "",
            "FOO@BAR.COM",
            "", "",
        ]);
        let c = decode_venue(&empty_lookups(), &r);
        assert_eq!(c.national_id, "12345678000199");
        assert_eq!(c.base_id(), "12345678");
        assert_eq!(c.head_or_branch.as_deref(), Some("MATRIZ"));
        assert_eq!(c.trade_name, "ACME STORE");
        assert_eq!(c.status_name.as_deref(), Some("ATIVA"));
        assert_eq!(c.status_date, RegistryDate::parse("20100115"));
        assert_eq!(c.primary_cnae, Some(4120400));
        assert_eq!(
            c.secondary_cnaes.iter().map(|x| x.code).collect::<Vec<_>>(),
            vec![7732201, 4399103]
        );
        assert_eq!(c.phone_1, "1133334444");
        assert_eq!(c.phone_2, "1155556666");
        assert_eq!(c.fax, "");
        assert_eq!(c.email.as_deref(), Some("foo@bar.com"));
        assert_eq!(c.state, "SP");
        // Base-registration fields wait for enrichment.
        assert_eq!(c.registered_name, "");
        assert_eq!(c.capital, None);
    }

    #[test]
    fn short_venue_row_does_not_panic() {
        let c = decode_venue(&empty_lookups(), &row(&["12345678", "0001", "99"]));
        assert_eq!(c.national_id, "12345678000199");
        assert_eq!(c.email, None);
        assert!(c.secondary_cnaes.is_empty());
    }
}
