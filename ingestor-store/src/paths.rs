//! Deterministic object-store key layout. `version_ts` uses
//! the sortable `YYYY-MM-DDTHH-MM-SS` (UTC, `:` replaced with `-`) form so
//! lexicographic order matches temporal order.

use chrono::{DateTime, Utc};

/// Formats a run's version timestamp.
pub fn format_version_ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S").to_string()
}

pub fn config_key(dataset_id: &str) -> String {
    format!("datasets/{dataset_id}/configs/config.yaml")
}

pub fn index_key(dataset_id: &str) -> String {
    format!("datasets/{dataset_id}/index/keys.parquet")
}

pub fn event_manifest_key(dataset_id: &str, version_ts: &str) -> String {
    format!("datasets/{dataset_id}/events/{version_ts}/manifest.json")
}

pub fn event_partition_key(dataset_id: &str, version_ts: &str, year: i32, month: u32) -> String {
    format!(
        "datasets/{dataset_id}/events/{version_ts}/data/year={year:04}/month={month:02}/part-0.parquet"
    )
}

/// Used when the source carries no date column.
pub fn event_unpartitioned_key(dataset_id: &str, version_ts: &str) -> String {
    format!("datasets/{dataset_id}/events/{version_ts}/data/part-0.parquet")
}

pub fn event_prefix(dataset_id: &str, version_ts: &str) -> String {
    format!("datasets/{dataset_id}/events/{version_ts}/")
}

pub fn events_root(dataset_id: &str) -> String {
    format!("datasets/{dataset_id}/events/")
}

pub fn event_index_key(dataset_id: &str, year: i32, month: u32) -> String {
    format!("datasets/{dataset_id}/events/index/{year:04}/{month:02}/versions.json")
}

pub fn projection_key(dataset_id: &str, year: i32, month: u32) -> String {
    format!("datasets/{dataset_id}/projections/windows/year={year:04}/month={month:02}/data.parquet")
}

pub fn projection_temp_key(dataset_id: &str, year: i32, month: u32) -> String {
    format!(
        "datasets/{dataset_id}/projections/windows/year={year:04}/month={month:02}/.tmp/data.parquet"
    )
}

pub fn projection_temp_prefix(dataset_id: &str, year: i32, month: u32) -> String {
    format!("datasets/{dataset_id}/projections/windows/year={year:04}/month={month:02}/.tmp/")
}

pub fn consolidation_manifest_key(dataset_id: &str, year: i32, month: u32) -> String {
    format!("datasets/{dataset_id}/projections/consolidation/{year:04}/{month:02}/manifest.json")
}

pub fn pointer_key(dataset_id: &str) -> String {
    format!("datasets/{dataset_id}/current/manifest.json")
}

/// The pipeline lock key for a dataset.
pub fn lock_key(dataset_id: &str) -> String {
    format!("pipeline:{dataset_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn version_ts_is_sortable_and_colon_free() {
        let a = format_version_ts(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        let b = format_version_ts(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 6).unwrap());
        assert_eq!(a, "2024-01-02T03-04-05");
        assert!(!a.contains(':'));
        assert!(a < b);
    }

    #[test]
    fn event_partition_key_zero_pads_month() {
        let key = event_partition_key("cpi", "2024-01-02T03-04-05", 2024, 2);
        assert_eq!(
            key,
            "datasets/cpi/events/2024-01-02T03-04-05/data/year=2024/month=02/part-0.parquet"
        );
    }

    #[test]
    fn lock_key_matches_pipeline_namespace() {
        assert_eq!(lock_key("cpi"), "pipeline:cpi");
    }

    #[test]
    fn projection_temp_key_lives_under_tmp() {
        let key = projection_temp_key("cpi", 2024, 1);
        assert!(key.starts_with(&projection_temp_prefix("cpi", 2024, 1)));
        assert_eq!(key, "datasets/cpi/projections/windows/year=2024/month=01/.tmp/data.parquet");
    }
}
