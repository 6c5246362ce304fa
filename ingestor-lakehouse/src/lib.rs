//! The monthly projection consolidator (spec §4.I): a write-ahead-log
//! idempotent rebuild of per-month read models from events.

#![allow(clippy::missing_errors_doc)]

pub mod consolidate;
pub mod manifest;

pub use consolidate::{consolidate_month, ConsolidationOutcome};
pub use manifest::{ConsolidationManifest, ConsolidationStatus};
