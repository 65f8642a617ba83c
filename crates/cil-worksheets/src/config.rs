use cil_core::worksheet_contracts::{BatchLimits, DEFAULT_GROUPS_PER_BATCH, DEFAULT_MAX_BATCHES};
use cil_core::SNAPSHOT_COLUMNS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SNIFF_BYTES: usize = 50 * 1024;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorksheetConfig {
    /// Minimum width of an accepted snapshot.
    pub expected_columns: usize,
    pub default_groups_per_batch: usize,
    pub default_max_batches: usize,
    /// How much of the snapshot is inspected when choosing the delimiter.
    pub sniff_bytes: usize,
    pub busy_timeout_ms: u64,
}

impl Default for WorksheetConfig {
    fn default() -> Self {
        Self {
            expected_columns: SNAPSHOT_COLUMNS,
            default_groups_per_batch: DEFAULT_GROUPS_PER_BATCH,
            default_max_batches: DEFAULT_MAX_BATCHES,
            sniff_bytes: DEFAULT_SNIFF_BYTES,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl WorksheetConfig {
    pub fn default_limits(&self) -> BatchLimits {
        BatchLimits {
            max_batches: self.default_max_batches,
            groups_per_batch: self.default_groups_per_batch,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// The record schema is positional, so a snapshot can never be accepted
    /// with fewer than `SNAPSHOT_COLUMNS` columns whatever the file says.
    pub fn required_columns(&self) -> usize {
        self.expected_columns.max(SNAPSHOT_COLUMNS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: WorksheetConfig = toml::from_str(
            "
            default_groups_per_batch = 20
            busy_timeout_ms = 250
            ",
        )
        .expect("parse config");

        assert_eq!(config.default_groups_per_batch, 20);
        assert_eq!(config.default_max_batches, DEFAULT_MAX_BATCHES);
        assert_eq!(config.expected_columns, SNAPSHOT_COLUMNS);
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.default_limits(),
            BatchLimits {
                max_batches: DEFAULT_MAX_BATCHES,
                groups_per_batch: 20,
            }
        );
    }

    #[test]
    fn required_columns_never_drop_below_schema_width() {
        let config = WorksheetConfig {
            expected_columns: 5,
            ..WorksheetConfig::default()
        };
        assert_eq!(config.required_columns(), SNAPSHOT_COLUMNS);

        let wider = WorksheetConfig {
            expected_columns: 40,
            ..WorksheetConfig::default()
        };
        assert_eq!(wider.required_columns(), 40);
    }
}
