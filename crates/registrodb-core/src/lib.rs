//! Core data model for the registrodb pipeline.
//!
//! This crate holds the types shared between the transform engine and the
//! database writers: the output [`Company`] record and its children, the
//! [`RegistryDate`] wrapper used for the registry's `YYYYMMDD` date fields,
//! and digit-level helpers for the 14-digit national ID (CNPJ).
//!
//! No I/O lives here.

pub mod cnpj;
pub mod date;
pub mod model;

pub use date::RegistryDate;
pub use model::{Cnae, Company, Partner, SimpleTaxStatus, TaxRegimes};
