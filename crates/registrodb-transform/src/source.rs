//! CSV source reader.
//!
//! The registry bundle is a directory of semicolon-delimited, Latin-1,
//! headerless CSV extracts. Files of one kind are recognized by a substring
//! of their name (`Empresas`, `Estabelecimentos`, `Socios`, ...), and one
//! [`Source`] owns every file of its kind, emitting rows to a bounded
//! channel in file order. No ordering is promised across kinds or across
//! files of the same kind.
//!
//! Readers are blocking (the `csv` crate reads `std::fs::File`) and are run
//! on the blocking thread pool by their callers.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransformError};

/// One kind of CSV extract in the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Legal-entity base registrations (`Empresas`).
    Base,
    /// Venues / establishments (`Estabelecimentos`).
    Venues,
    /// Partner boards (`Socios`).
    Partners,
    /// Simples Nacional and MEI opt-ins (`Simples`).
    SimpleTaxes,
    /// Real-profit tax regime (`Lucro`).
    RealProfit,
    /// Presumed-profit tax regime (`Presumido`).
    PresumedProfit,
    /// Arbitrated-profit tax regime (`Arbitrado`).
    ArbitratedProfit,
    /// Immune/exempt tax regime (`Imune`).
    Exempt,
}

impl SourceKind {
    /// Every kind staged into the key-value store during Phase A.
    pub const STAGED: [SourceKind; 7] = [
        SourceKind::Base,
        SourceKind::Partners,
        SourceKind::SimpleTaxes,
        SourceKind::Exempt,
        SourceKind::PresumedProfit,
        SourceKind::RealProfit,
        SourceKind::ArbitratedProfit,
    ];

    /// Substring that identifies this kind's files.
    pub fn file_pattern(self) -> &'static str {
        match self {
            SourceKind::Base => "Empresas",
            SourceKind::Venues => "Estabelecimentos",
            SourceKind::Partners => "Socios",
            SourceKind::SimpleTaxes => "Simples",
            SourceKind::RealProfit => "Lucro",
            SourceKind::PresumedProfit => "Presumido",
            SourceKind::ArbitratedProfit => "Arbitrado",
            SourceKind::Exempt => "Imune",
        }
    }

    /// Kinds with several rows per ID get a per-row hash suffix in their
    /// stage key so the rows coexist in the store.
    pub fn is_accumulative(self) -> bool {
        !matches!(self, SourceKind::Base)
    }

    /// Rough bytes-per-row used for the progress total. Good enough for a
    /// progress bar, irrelevant for correctness.
    fn avg_row_bytes(self) -> u64 {
        match self {
            SourceKind::Base => 110,
            SourceKind::Venues => 180,
            SourceKind::Partners => 130,
            SourceKind::SimpleTaxes => 60,
            SourceKind::RealProfit
            | SourceKind::PresumedProfit
            | SourceKind::ArbitratedProfit
            | SourceKind::Exempt => 40,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Base => "base",
            SourceKind::Venues => "venues",
            SourceKind::Partners => "partners",
            SourceKind::SimpleTaxes => "simple-taxes",
            SourceKind::RealProfit => "real-profit",
            SourceKind::PresumedProfit => "presumed-profit",
            SourceKind::ArbitratedProfit => "arbitrated-profit",
            SourceKind::Exempt => "exempt",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Decode a Latin-1 byte sequence. Every ISO-8859-1 byte maps 1:1 onto the
/// Unicode code point of the same value.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// All files of one kind, plus a row-count estimate for progress tracking.
pub struct Source {
    kind: SourceKind,
    files: Vec<PathBuf>,
    total_rows: u64,
}

impl Source {
    /// Enumerate the files of `kind` under `dir`. At least one file must
    /// exist.
    pub fn open(dir: &Path, kind: SourceKind) -> Result<Self> {
        let mut files = Vec::new();
        let mut total_bytes = 0u64;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if name.to_string_lossy().contains(kind.file_pattern()) {
                total_bytes += entry.metadata()?.len();
                files.push(entry.path());
            }
        }
        if files.is_empty() {
            return Err(TransformError::MissingSource {
                kind: kind.label(),
                dir: dir.to_path_buf(),
            });
        }
        files.sort();
        Ok(Self {
            kind,
            files,
            total_rows: total_bytes / kind.avg_row_bytes(),
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Estimated total rows across all files of this kind.
    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }

    /// Drain every file into `tx`, one `Vec<String>` per row.
    ///
    /// Blocking; run on the blocking pool. Malformed rows are logged and
    /// skipped. Returns early (without error) when the token is canceled or
    /// the receiving side goes away.
    pub fn send_to(&self, cancel: &CancellationToken, tx: &mpsc::Sender<Vec<String>>) -> Result<()> {
        for path in &self.files {
            tracing::debug!(kind = %self.kind, path = %path.display(), "reading source file");
            let file = fs::File::open(path)?;
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(b';')
                .has_headers(false)
                .flexible(true)
                .from_reader(file);
            let mut record = csv::ByteRecord::new();
            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                match reader.read_byte_record(&mut record) {
                    Ok(true) => {
                        let row: Vec<String> =
                            record.iter().map(latin1_to_string).collect();
                        if tx.blocking_send(row).is_err() {
                            // Receiver gone: the run is shutting down.
                            return Ok(());
                        }
                    }
                    Ok(false) => break,
                    Err(e) => {
                        tracing::warn!(kind = %self.kind, path = %path.display(), error = %e, "skipping malformed row");
                        // An I/O failure repeats on every read; give up on
                        // this file instead of spinning on it.
                        if e.is_io_error() {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
