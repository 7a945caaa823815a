//! Code-to-description lookup tables.
//!
//! Six small auxiliary extracts map numeric codes to their human
//! descriptions (economic activity, municipality, legal nature, partner
//! qualification, country, status reason). They load eagerly at startup and
//! are immutable afterwards, so readers share them without synchronization.
//! A missing code always resolves to an empty string.
//!
//! A handful of mappings are fixed by the registry's documentation rather
//! than shipped as files; those live here as plain functions.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, TransformError};
use crate::source::latin1_to_string;

/// Filename substrings of the six lookup extracts.
const CNAES: &str = "Cnaes";
const MUNICIPALITIES: &str = "Municipios";
const LEGAL_NATURES: &str = "Naturezas";
const QUALIFICATIONS: &str = "Qualificacoes";
const COUNTRIES: &str = "Paises";
const REASONS: &str = "Motivos";

/// All lookup tables, loaded once per run.
pub struct Lookups {
    cnaes: HashMap<i64, String>,
    municipalities: HashMap<i64, String>,
    legal_natures: HashMap<i64, String>,
    qualifications: HashMap<i64, String>,
    countries: HashMap<i64, String>,
    reasons: HashMap<i64, String>,
}

impl Lookups {
    pub fn load(dir: &Path) -> Result<Self> {
        let lookups = Self {
            cnaes: load_code_map(dir, CNAES)?,
            municipalities: load_code_map(dir, MUNICIPALITIES)?,
            legal_natures: load_code_map(dir, LEGAL_NATURES)?,
            qualifications: load_code_map(dir, QUALIFICATIONS)?,
            countries: load_code_map(dir, COUNTRIES)?,
            reasons: load_code_map(dir, REASONS)?,
        };
        tracing::debug!(
            cnaes = lookups.cnaes.len(),
            municipalities = lookups.municipalities.len(),
            legal_natures = lookups.legal_natures.len(),
            qualifications = lookups.qualifications.len(),
            countries = lookups.countries.len(),
            reasons = lookups.reasons.len(),
            "lookup tables loaded"
        );
        Ok(lookups)
    }

    pub fn cnae(&self, code: i64) -> String {
        self.cnaes.get(&code).cloned().unwrap_or_default()
    }

    pub fn municipality(&self, code: i64) -> String {
        self.municipalities.get(&code).cloned().unwrap_or_default()
    }

    pub fn legal_nature(&self, code: i64) -> String {
        self.legal_natures.get(&code).cloned().unwrap_or_default()
    }

    pub fn qualification(&self, code: i64) -> String {
        self.qualifications.get(&code).cloned().unwrap_or_default()
    }

    pub fn country(&self, code: i64) -> String {
        self.countries.get(&code).cloned().unwrap_or_default()
    }

    pub fn reason(&self, code: i64) -> String {
        self.reasons.get(&code).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
impl Lookups {
    /// Empty tables, for decoder tests that only need the fallback path.
    pub(crate) fn empty() -> Self {
        Self {
            cnaes: HashMap::new(),
            municipalities: HashMap::new(),
            legal_natures: HashMap::new(),
            qualifications: HashMap::new(),
            countries: HashMap::new(),
            reasons: HashMap::new(),
        }
    }
}

/// Load one `code;description` extract. Every file whose name contains
/// `pattern` contributes; at least one must exist.
fn load_code_map(dir: &Path, pattern: &'static str) -> Result<HashMap<i64, String>> {
    let mut found = false;
    let mut map = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file()
            || !entry.file_name().to_string_lossy().contains(pattern)
        {
            continue;
        }
        found = true;
        let file = fs::File::open(entry.path())?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(false)
            .flexible(true)
            .from_reader(file);
        for record in reader.byte_records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "skipping malformed lookup row");
                    continue;
                }
            };
            let code = record.get(0).map(latin1_to_string).unwrap_or_default();
            let Ok(code) = code.trim().parse::<i64>() else {
                continue;
            };
            let description = record.get(1).map(latin1_to_string).unwrap_or_default();
            map.insert(code, description.trim().to_string());
        }
    }
    if !found {
        return Err(TransformError::MissingSource {
            kind: pattern,
            dir: dir.to_path_buf(),
        });
    }
    Ok(map)
}

/// Registration status, from the registry's documentation.
pub fn status_name(code: i32) -> &'static str {
    match code {
        1 => "NULA",
        2 => "ATIVA",
        3 => "SUSPENSA",
        4 => "INAPTA",
        8 => "BAIXADA",
        _ => "",
    }
}

/// Company size.
pub fn size_name(code: i32) -> &'static str {
    match code {
        0 => "NÃO INFORMADO",
        1 => "MICRO EMPRESA",
        3 => "EMPRESA DE PEQUENO PORTE",
        5 => "DEMAIS",
        _ => "",
    }
}

/// Head office or branch.
pub fn head_or_branch_name(code: i32) -> &'static str {
    match code {
        1 => "MATRIZ",
        2 => "FILIAL",
        _ => "",
    }
}

/// Partner identification type.
pub fn partner_identification_name(code: i32) -> &'static str {
    match code {
        1 => "PESSOA JURÍDICA",
        2 => "PESSOA FÍSICA",
        3 => "ESTRANGEIRO",
        _ => "",
    }
}

/// Partner age range.
pub fn age_range_name(code: i32) -> &'static str {
    match code {
        0 => "Não se aplica",
        1 => "0 a 12 anos",
        2 => "13 a 20 anos",
        3 => "21 a 30 anos",
        4 => "31 a 40 anos",
        5 => "41 a 50 anos",
        6 => "51 a 60 anos",
        7 => "61 a 70 anos",
        8 => "71 a 80 anos",
        9 => "Maiores de 80 anos",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn to_latin1(s: &str) -> Vec<u8> {
        s.chars().map(|c| (c as u32) as u8).collect()
    }

    fn write_lookups(dir: &Path) {
        let files = [
            ("Cnaes.csv", "4120400;Construção de edifícios\n"),
            ("Municipios.csv", "7107;São Paulo\n"),
            ("Naturezas.csv", "2062;Sociedade Empresária Limitada\n"),
            ("Qualificacoes.csv", "49;Sócio-Administrador\n"),
            ("Paises.csv", "105;Brasil\n"),
            ("Motivos.csv", "0;Sem motivo\n1;Extinção por encerramento\n"),
        ];
        for (name, content) in files {
            let mut f = fs::File::create(dir.join(name)).unwrap();
            f.write_all(&to_latin1(content)).unwrap();
        }
    }

    #[test]
    fn loads_all_six_tables() {
        let dir = tempfile::tempdir().unwrap();
        write_lookups(dir.path());
        let lookups = Lookups::load(dir.path()).unwrap();
        assert_eq!(lookups.cnae(4120400), "Construção de edifícios");
        assert_eq!(lookups.municipality(7107), "São Paulo");
        assert_eq!(lookups.legal_nature(2062), "Sociedade Empresária Limitada");
        assert_eq!(lookups.qualification(49), "Sócio-Administrador");
        assert_eq!(lookups.country(105), "Brasil");
        assert_eq!(lookups.reason(1), "Extinção por encerramento");
    }

    #[test]
    fn missing_code_resolves_to_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        write_lookups(dir.path());
        let lookups = Lookups::load(dir.path()).unwrap();
        assert_eq!(lookups.cnae(9999999), "");
        assert_eq!(lookups.reason(12345), "");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Lookups::load(dir.path()).unwrap_err();
        assert!(matches!(err, TransformError::MissingSource { .. }));
    }

    #[test]
    fn fixed_tables_cover_documented_codes() {
        assert_eq!(status_name(2), "ATIVA");
        assert_eq!(status_name(8), "BAIXADA");
        assert_eq!(status_name(7), "");
        assert_eq!(size_name(1), "MICRO EMPRESA");
        assert_eq!(head_or_branch_name(2), "FILIAL");
        assert_eq!(partner_identification_name(2), "PESSOA FÍSICA");
        assert_eq!(age_range_name(9), "Maiores de 80 anos");
        assert_eq!(age_range_name(42), "");
    }
}
