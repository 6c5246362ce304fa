//! Primary-key hashing: `key_hash = SHA1(join('|', str(row[pk])))`.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch, StringArray};
use arrow::datatypes::Field;
use sha1::{Digest, Sha1};

use crate::error::TypesError;
use crate::row::{column_value_as_string, columns};

/// Computes the `key_hash` hex string for a single row, given the ordered
/// list of primary-key column names.
pub fn row_key_hash(batch: &RecordBatch, row: usize, primary_keys: &[String]) -> Result<String, TypesError> {
    let parts: Result<Vec<String>, TypesError> = primary_keys
        .iter()
        .map(|col| column_value_as_string(batch, col, row))
        .collect();
    let joined = parts?.join("|");
    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Computes `key_hash` for every row of `batch` and returns it as a new
/// Arrow array, ready to be appended as the transient `key_hash` column.
pub fn compute_key_hash_column(batch: &RecordBatch, primary_keys: &[String]) -> Result<ArrayRef, TypesError> {
    if primary_keys.is_empty() {
        return Err(TypesError::InvalidConfig(
            "primary_keys must name at least one column".into(),
        ));
    }
    let mut hashes = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        hashes.push(row_key_hash(batch, row, primary_keys)?);
    }
    Ok(Arc::new(StringArray::from(hashes)) as ArrayRef)
}

/// Appends the `key_hash` column to `batch`, returning a batch whose schema
/// matches [`crate::row::schema_with_key_hash`] provided `batch` already
/// matches [`crate::row::logical_schema`].
pub fn with_key_hash(batch: &RecordBatch, primary_keys: &[String]) -> Result<RecordBatch, TypesError> {
    let hash_col = compute_key_hash_column(batch, primary_keys)?;
    let mut fields: Vec<Field> = batch.schema().fields().iter().map(|f| (**f).clone()).collect();
    fields.push(Field::new(columns::KEY_HASH, arrow::datatypes::DataType::Utf8, false));
    let mut cols: Vec<ArrayRef> = batch.columns().to_vec();
    cols.push(hash_col);
    RecordBatch::try_new(Arc::new(arrow::datatypes::Schema::new(fields)), cols)
        .map_err(|e| TypesError::SchemaMismatch(e.to_string()))
}

/// Projects just the `key_hash` column out of a batch that already carries
/// it, matching the single-column index schema.
pub fn project_key_hash(batch: &RecordBatch) -> Result<RecordBatch, TypesError> {
    let idx = batch
        .schema()
        .index_of(columns::KEY_HASH)
        .map_err(|_| TypesError::MissingColumn(columns::KEY_HASH.to_string()))?;
    let array = batch.column(idx).clone();
    RecordBatch::try_new(crate::row::index_schema(), vec![array])
        .map_err(|e| TypesError::SchemaMismatch(e.to_string()))
}
