//! Venue enrichment against the staged store.
//!
//! A [`Company`] seeded from a venue row gains its base registration,
//! partner board, Simples/MEI status and tax-regime history with four
//! concurrent store lookups. The first failing path fails the enrichment.

use std::sync::Arc;

use registrodb_core::{Company, Partner, SimpleTaxStatus, TaxRegimes};

use crate::error::Result;
use crate::kv::KvStore;
use crate::rows::{
    base_key, partner_prefix, regime_prefix, simple_taxes_prefix, BaseRecord, TaxRegimeRecord,
};

/// Enrich one seeded company. With `privacy` set, personally identifiable
/// information is scrubbed before the record is returned.
pub async fn enrich_company(
    kv: &Arc<KvStore>,
    mut company: Company,
    privacy: bool,
) -> Result<Company> {
    let base = company.base_id().to_string();
    let national_id = company.national_id.clone();
    let (partners, base_record, simple_taxes, tax_regimes) = tokio::try_join!(
        partners_of(kv.clone(), base.clone()),
        base_of(kv.clone(), base.clone()),
        simple_taxes_of(kv.clone(), base),
        tax_regimes_of(kv.clone(), national_id),
    )?;

    company.partners = partners;
    if let Some(record) = base_record {
        apply_base(&mut company, record);
    }
    company.simple_taxes = simple_taxes;
    company.tax_regimes = tax_regimes;
    if privacy {
        company.scrub_pii();
    }
    Ok(company)
}

fn apply_base(company: &mut Company, record: BaseRecord) {
    company.registered_name = record.registered_name;
    company.legal_nature_code = record.legal_nature_code;
    company.legal_nature = record.legal_nature;
    company.responsible_qualification_code = record.responsible_qualification_code;
    company.responsible_qualification = record.responsible_qualification;
    company.size_code = record.size_code;
    company.size_name = record.size_name;
    company.capital = record.capital;
    company.federated_entity_responsible = record.federated_entity_responsible;
}

async fn partners_of(kv: Arc<KvStore>, base: String) -> Result<Vec<Partner>> {
    tokio::task::spawn_blocking(move || {
        kv.scan_prefix(partner_prefix(&base).as_bytes())?
            .iter()
            .map(|value| bincode::deserialize(value).map_err(Into::into))
            .collect()
    })
    .await?
}

/// Point read; a miss leaves the seeded fields alone.
async fn base_of(kv: Arc<KvStore>, base: String) -> Result<Option<BaseRecord>> {
    tokio::task::spawn_blocking(move || {
        match kv.get(base_key(&base).as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    })
    .await?
}

/// The store can hold several opt-in rows per base; the last scanned entry
/// wins.
async fn simple_taxes_of(kv: Arc<KvStore>, base: String) -> Result<Option<SimpleTaxStatus>> {
    tokio::task::spawn_blocking(move || {
        match kv.scan_prefix(simple_taxes_prefix(&base).as_bytes())?.last() {
            Some(value) => Ok(Some(bincode::deserialize(value)?)),
            None => Ok(None),
        }
    })
    .await?
}

/// Fold every staged regime row into the four annual series.
async fn tax_regimes_of(kv: Arc<KvStore>, national_id: String) -> Result<TaxRegimes> {
    tokio::task::spawn_blocking(move || {
        let mut regimes = TaxRegimes::default();
        for value in kv.scan_prefix(regime_prefix(&national_id).as_bytes())? {
            let record: TaxRegimeRecord = bincode::deserialize(&value)?;
            record.fold_into(&mut regimes);
        }
        Ok(regimes)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookups::Lookups;
    use crate::rows::decode_staged;
    use crate::source::SourceKind;

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    fn store_with(rows: &[(SourceKind, Vec<String>)]) -> (Arc<KvStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::create(dir.path()).unwrap();
        let lookups = Lookups::empty();
        let staged: Vec<_> = rows
            .iter()
            .map(|(kind, r)| decode_staged(*kind, &lookups, r).unwrap())
            .collect();
        kv.write_chunk(&staged).unwrap();
        (Arc::new(kv), dir)
    }

    fn seeded(national_id: &str) -> Company {
        Company {
            national_id: national_id.to_string(),
            ..Company::default()
        }
    }

    #[tokio::test]
    async fn base_fields_fold_into_the_company() {
        let (kv, _dir) = store_with(&[(
            SourceKind::Base,
            row(&["12345678", "ACME LTDA", "2050", "41", "1", "100000,00", ""]),
        )]);
        let c = enrich_company(&kv, seeded("12345678000199"), true).await.unwrap();
        assert_eq!(c.registered_name, "ACME LTDA");
        assert_eq!(c.capital, Some("100000.00".parse().unwrap()));
        assert_eq!(c.size_name.as_deref(), Some("MICRO EMPRESA"));
        assert!(c.partners.is_empty());
        assert!(c.tax_regimes.is_empty());
    }

    #[tokio::test]
    async fn base_miss_leaves_seeded_fields_alone() {
        let (kv, _dir) = store_with(&[]);
        let mut company = seeded("99999999000100");
        company.trade_name = "SEEDED".to_string();
        let c = enrich_company(&kv, company, true).await.unwrap();
        assert_eq!(c.trade_name, "SEEDED");
        assert_eq!(c.registered_name, "");
        assert_eq!(c.simple_taxes, None);
    }

    #[tokio::test]
    async fn duplicate_partner_rows_collapse_in_the_store() {
        let alice = row(&["22222222", "2", "ALICE", "", "49", "20200101"]);
        let bob = row(&["22222222", "2", "BOB", "", "49", "20200101"]);
        let (kv, _dir) = store_with(&[
            (SourceKind::Partners, alice.clone()),
            (SourceKind::Partners, bob),
            (SourceKind::Partners, alice),
        ]);
        let c = enrich_company(&kv, seeded("22222222000100"), true).await.unwrap();
        let mut names: Vec<_> = c.partners.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["ALICE", "BOB"]);
    }

    #[tokio::test]
    async fn privacy_flag_scrubs_pii() {
        let partner = row(&["12345678", "2", "ALICE", "12345678901", "49", "20200101"]);
        let rows = [
            (SourceKind::Base, row(&["12345678", "ACME", "", "", "", "", ""])),
            (SourceKind::Partners, partner),
        ];
        let (kv, _dir) = store_with(&rows);
        let mut company = seeded("12345678000199");
        company.email = Some("foo@bar.com".to_string());
        company.phone_1 = "1133334444".to_string();

        let open = enrich_company(&kv, company.clone(), false).await.unwrap();
        assert_eq!(open.email.as_deref(), Some("foo@bar.com"));
        assert_eq!(open.phone_1, "1133334444");
        assert_eq!(open.partners[0].tax_id.as_deref(), Some("12345678901"));

        let scrubbed = enrich_company(&kv, company, true).await.unwrap();
        assert_eq!(scrubbed.email, None);
        assert_eq!(scrubbed.phone_1, "");
        assert_eq!(scrubbed.partners[0].tax_id, None);
    }

    #[tokio::test]
    async fn regime_rows_accumulate_per_series() {
        let id = "33333333000144";
        let rows = [
            (
                SourceKind::RealProfit,
                row(&["2020", id, "", "LUCRO REAL", "1"]),
            ),
            (
                SourceKind::RealProfit,
                row(&["2021", id, "", "LUCRO REAL", "2"]),
            ),
        ];
        let (kv, _dir) = store_with(&rows);
        let c = enrich_company(&kv, seeded(id), true).await.unwrap();
        assert_eq!(
            c.tax_regimes.real_profit.keys().copied().collect::<Vec<_>>(),
            vec![2020, 2021]
        );
        assert!(c.tax_regimes.presumed_profit.is_empty());
        assert!(c.tax_regimes.arbitrated_profit.is_empty());
        assert!(c.tax_regimes.exempt.is_empty());
    }

    #[tokio::test]
    async fn absent_regimes_yield_an_empty_but_present_map() {
        let (kv, _dir) = store_with(&[]);
        let c = enrich_company(&kv, seeded("44444444000155"), true).await.unwrap();
        assert!(c.tax_regimes.is_empty());
    }

    #[tokio::test]
    async fn simple_taxes_prefer_the_last_scanned_entry() {
        let first = row(&["12345678", "S", "20180701", "", "N", "", ""]);
        let second = row(&["12345678", "N", "20180701", "20190101", "N", "", ""]);
        let (kv, _dir) = store_with(&[
            (SourceKind::SimpleTaxes, first),
            (SourceKind::SimpleTaxes, second),
        ]);
        let c = enrich_company(&kv, seeded("12345678000199"), true).await.unwrap();
        // One of the two staged entries, whole, never a blend.
        let taxes = c.simple_taxes.expect("staged opt-in present");
        match taxes.simple_opted_in {
            Some(true) => assert_eq!(taxes.simple_exit_date, None),
            Some(false) => assert!(taxes.simple_exit_date.is_some()),
            None => panic!("flag lost in enrichment"),
        }
    }
}
