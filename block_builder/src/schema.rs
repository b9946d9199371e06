//! Day-to-chunk-store schema selection.
//!
//! Chunk storage is configured in periods: each period has a start day and
//! names the store prefix holding that period's chunk objects. At most one
//! period covers a given day; periods are half-open, so a day equal to a
//! period's start belongs to that period.

use std::{fs, path::Path};

use chrono::NaiveDate;
use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

/// Schema configuration errors.
#[derive(Debug, Snafu)]
pub enum SchemaError {
    #[snafu(display("failed to read schema config {path}: {source}"))]
    #[allow(missing_docs)]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse schema config {path}: {source}"))]
    #[allow(missing_docs)]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    /// Periods must be listed in ascending order of start day.
    #[snafu(display("schema config periods are not in ascending order of start day"))]
    NotAscending,

    #[snafu(display("no schema for day {day}"))]
    #[allow(missing_docs)]
    NoSchemaForDay { day: NaiveDate },
}

/// One chunk storage period.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeriodConfig {
    /// First day (inclusive) this period covers.
    pub from: NaiveDate,
    /// Object-store prefix under which this period's chunks live.
    pub prefix: String,
}

/// The full period schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SchemaConfig {
    /// Periods in ascending order of `from`.
    pub configs: Vec<PeriodConfig>,
}

impl SchemaConfig {
    /// Load and validate a schema config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let display = path.display().to_string();
        let raw = fs::read(path).context(ReadSnafu {
            path: display.clone(),
        })?;
        let config: Self = serde_json::from_slice(&raw).context(ParseSnafu { path: display })?;
        ensure!(
            config.configs.windows(2).all(|w| w[0].from < w[1].from),
            NotAscendingSnafu
        );
        Ok(config)
    }

    /// Find the period covering `day`: the one whose `from` is on or before
    /// `day` and whose successor starts after `day`.
    pub fn config_for_day(&self, day: NaiveDate) -> Result<&PeriodConfig, SchemaError> {
        for (ix, period) in self.configs.iter().enumerate() {
            if day < period.from {
                continue;
            }
            if let Some(next) = self.configs.get(ix + 1) {
                if day >= next.from {
                    continue;
                }
            }
            return Ok(period);
        }
        NoSchemaForDaySnafu { day }.fail()
    }
}
