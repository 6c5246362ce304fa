//! The delta engine: primary-key hashing, anti-join against the current
//! index, and index merge. Pure — no I/O.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{Array, AsArray, BooleanArray, RecordBatch, StringArray};
use arrow::compute::filter_record_batch;
use ingestor_types::hash::with_key_hash;
use ingestor_types::row::{columns, index_schema};

/// The result of a delta computation.
pub struct DeltaResult {
    /// Rows of `normalized` not already present in the index, with the
    /// transient `key_hash` column appended.
    pub delta: RecordBatch,
    /// `dedupe(index ∪ project(delta, key_hash))`, keeping first occurrence.
    pub updated_index: RecordBatch,
    /// The index frame as it was handed in, unchanged.
    pub index_snapshot: RecordBatch,
}

fn index_key_set(index: &RecordBatch) -> anyhow::Result<HashSet<String>> {
    let col = index
        .column_by_name(columns::KEY_HASH)
        .ok_or_else(|| anyhow::anyhow!("index frame is missing the key_hash column"))?;
    let array = col.as_string::<i32>();
    Ok((0..array.len()).map(|i| array.value(i).to_string()).collect())
}

/// Computes the delta of `normalized` against `index` for the given
/// `primary_keys`.
pub fn compute_delta(
    normalized: &RecordBatch,
    index: &RecordBatch,
    primary_keys: &[String],
) -> anyhow::Result<DeltaResult> {
    let with_hash = with_key_hash(normalized, primary_keys)?;
    let existing = index_key_set(index)?;

    let hash_col = with_hash
        .column_by_name(columns::KEY_HASH)
        .expect("with_key_hash always appends key_hash")
        .as_string::<i32>();
    let mask: BooleanArray = (0..hash_col.len())
        .map(|i| Some(!existing.contains(hash_col.value(i))))
        .collect();
    let delta = filter_record_batch(&with_hash, &mask)?;

    let delta_hash_col = delta
        .column_by_name(columns::KEY_HASH)
        .expect("delta retains key_hash")
        .as_string::<i32>();

    let mut seen = existing;
    let mut merged: Vec<String> = Vec::with_capacity(seen.len() + delta.num_rows());
    // Preserve the index's own order first (first-occurrence rule).
    {
        let existing_col = index.column_by_name(columns::KEY_HASH).unwrap().as_string::<i32>();
        merged.extend((0..existing_col.len()).map(|i| existing_col.value(i).to_string()));
    }
    for i in 0..delta_hash_col.len() {
        let h = delta_hash_col.value(i);
        if seen.insert(h.to_string()) {
            merged.push(h.to_string());
        }
    }

    let updated_index = RecordBatch::try_new(index_schema(), vec![Arc::new(StringArray::from(merged))])?;

    Ok(DeltaResult {
        delta,
        updated_index,
        index_snapshot: index.clone(),
    })
}

/// An empty index frame, used on cold start when no pointer exists yet.
pub fn empty_index() -> RecordBatch {
    RecordBatch::new_empty(index_schema())
}
