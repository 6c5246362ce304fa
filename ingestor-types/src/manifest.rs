//! The event manifest and pointer: shared between the
//! publisher and consistency guard (`ingestor-ingestion`) and the
//! projection consolidator (`ingestor-lakehouse`), none of which depend on
//! each other for these plain data types.

use serde::{Deserialize, Serialize};

use crate::fingerprint::SourceFingerprint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventManifestSource {
    pub files: Vec<SourceFingerprint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventManifestOutputs {
    pub data_prefix: String,
    pub files: Vec<String>,
    pub rows_total: u64,
    pub rows_added_this_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventManifestIndex {
    pub path: String,
    pub key_columns: Vec<String>,
    pub hash_column: String,
}

/// `events/<version_ts>/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventManifest {
    pub dataset_id: String,
    pub version: String,
    pub created_at: String,
    pub source: EventManifestSource,
    pub outputs: EventManifestOutputs,
    pub index: EventManifestIndex,
}

/// `current/manifest.json`, the CAS target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pointer {
    pub dataset_id: String,
    pub current_version: String,
}
