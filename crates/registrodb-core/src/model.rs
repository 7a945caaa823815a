//! The output record assembled by the pipeline.
//!
//! A [`Company`] is one venue (establishment) of a legal entity, seeded from
//! a venue CSV row and enriched with the legal entity's base registration,
//! its partner board, its Simples/MEI status and its tax-regime history. The
//! JSON emitted for the document-mode table is the serde serialization of
//! this struct, so field names here are the public document schema.

use std::collections::BTreeMap;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::date::RegistryDate;

/// An economic-activity code with its human description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cnae {
    pub code: i32,
    pub description: String,
}

/// A participant in a legal entity's partner board.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    /// 1 = legal person, 2 = natural person, 3 = foreign.
    pub identification_type: Option<i32>,
    pub identification_type_description: Option<String>,
    pub name: String,
    /// Masked in the source for natural persons; `None` when unusable.
    pub tax_id: Option<String>,
    pub qualification_code: Option<i32>,
    pub qualification: Option<String>,
    pub entry_date: Option<RegistryDate>,
    pub country_code: Option<i32>,
    pub country: Option<String>,
    pub representative_tax_id: Option<String>,
    pub representative_name: String,
    pub representative_qualification_code: Option<i32>,
    pub representative_qualification: Option<String>,
    pub age_range_code: Option<i32>,
    pub age_range: Option<String>,
}

/// Simples Nacional and MEI opt-in flags with their entry/exit dates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleTaxStatus {
    pub simple_opted_in: Option<bool>,
    pub simple_entry_date: Option<RegistryDate>,
    pub simple_exit_date: Option<RegistryDate>,
    pub mei_opted_in: Option<bool>,
    pub mei_entry_date: Option<RegistryDate>,
    pub mei_exit_date: Option<RegistryDate>,
}

/// Per-year tax-classification history, one map per regime stream.
///
/// Keys are fiscal years, values the number of bookkeeping records declared
/// for that year. Rows accumulate: two source rows for the same national ID
/// contribute independent entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRegimes {
    pub real_profit: BTreeMap<i32, u32>,
    pub presumed_profit: BTreeMap<i32, u32>,
    pub arbitrated_profit: BTreeMap<i32, u32>,
    pub exempt: BTreeMap<i32, u32>,
}

impl TaxRegimes {
    pub fn is_empty(&self) -> bool {
        self.real_profit.is_empty()
            && self.presumed_profit.is_empty()
            && self.arbitrated_profit.is_empty()
            && self.exempt.is_empty()
    }
}

/// One fully enriched venue record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Company {
    /// The 14-digit national ID, digits only.
    pub national_id: String,
    /// 1 = head office, 2 = branch.
    pub head_or_branch_code: Option<i32>,
    pub head_or_branch: Option<String>,
    pub registered_name: String,
    pub trade_name: String,
    pub status_code: Option<i32>,
    pub status_name: Option<String>,
    pub status_date: Option<RegistryDate>,
    pub status_reason_code: Option<i32>,
    pub status_reason: Option<String>,
    pub city_abroad: String,
    pub country_code: Option<i32>,
    pub country: Option<String>,
    pub activity_start_date: Option<RegistryDate>,
    pub primary_cnae: Option<i32>,
    pub primary_cnae_description: Option<String>,
    pub secondary_cnaes: Vec<Cnae>,
    pub street_type: String,
    pub street: String,
    pub number: String,
    pub complement: String,
    pub neighborhood: String,
    pub postal_code: String,
    pub state: String,
    pub municipality_code: Option<i32>,
    pub municipality: Option<String>,
    pub phone_1: String,
    pub phone_2: String,
    pub fax: String,
    pub email: Option<String>,
    pub special_situation: String,
    pub special_situation_date: Option<RegistryDate>,
    // Fields below come from the legal entity's base registration.
    pub legal_nature_code: Option<i32>,
    pub legal_nature: Option<String>,
    pub responsible_qualification_code: Option<i32>,
    pub responsible_qualification: Option<String>,
    pub capital: Option<BigDecimal>,
    pub size_code: Option<i32>,
    pub size_name: Option<String>,
    pub federated_entity_responsible: String,
    pub partners: Vec<Partner>,
    pub simple_taxes: Option<SimpleTaxStatus>,
    pub tax_regimes: TaxRegimes,
}

impl Company {
    /// The 8-digit base shared by every venue of the legal entity.
    pub fn base_id(&self) -> &str {
        crate::cnpj::base(&self.national_id)
    }

    /// Comma-join of the non-empty phone 1, phone 2 and fax numbers.
    pub fn phones_csv(&self) -> String {
        [&self.phone_1, &self.phone_2, &self.fax]
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Comma-join of the secondary CNAE codes in decode order.
    pub fn secondary_cnaes_csv(&self) -> String {
        self.secondary_cnaes
            .iter()
            .map(|c| c.code.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Remove personally identifiable information before emission.
    ///
    /// Clears email, phone numbers and fax, and every partner's tax ID and
    /// legal-representative tax ID.
    pub fn scrub_pii(&mut self) {
        self.email = None;
        self.phone_1.clear();
        self.phone_2.clear();
        self.fax.clear();
        for partner in &mut self.partners {
            partner.tax_id = None;
            partner.representative_tax_id = None;
        }
    }
}
