mod schema;
mod sqlite;

pub use schema::{reconcile, Reconciled, ACTUAL_COLUMNS, COMPARISON_COLUMNS, FORECAST_COLUMNS, FORECAST_VALUE_COLUMNS};
pub use sqlite::SqliteStore;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use time::Date;

use crate::models::{format_date, ActualObservation, ComparisonRow, ForecastPoint};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Failed to query sqlite: {0}")]
    Query(#[from] sqlx::Error),
    #[error("Failed to run database migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to format time string: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Failed to parse stored time '{value}': {source}")]
    TimeParse {
        value: String,
        source: time::error::Parse,
    },
    #[error("Row has {found} values but {table} has {expected} columns")]
    RowWidth {
        table: Table,
        expected: usize,
        found: usize,
    },
    #[error("Stored value out of range in {table}.{column}: {value}")]
    OutOfRange {
        table: Table,
        column: &'static str,
        value: i64,
    },
}

/// A single cell headed for the store
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Value::Null, Value::Real)
    }
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        value.map_or(Value::Null, Value::Text)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

/// Column name to value, before reconciliation onto a table's canonical columns
pub type Record = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Actual,
    Forecast,
    Comparison,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Actual => "weather_actl",
            Table::Forecast => "weather_fcst",
            Table::Comparison => "weather_avf_compare",
        }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Actual => &ACTUAL_COLUMNS,
            Table::Forecast => &FORECAST_COLUMNS,
            Table::Comparison => &COMPARISON_COLUMNS,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Half-open range of local dates, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateWindow {
    pub start: Date,
    pub end: Date,
}

impl DateWindow {
    pub fn new(start: Date, end: Date) -> Self {
        Self { start, end }
    }

    pub fn day(date: Date) -> Self {
        Self {
            start: date,
            end: date.next_day().unwrap_or(date),
        }
    }

    /// `date` widened by `days` on both sides
    pub fn around(date: Date, days: i64) -> Self {
        let span = time::Duration::days(days);
        Self {
            start: date.checked_sub(span).unwrap_or(date),
            end: date
                .checked_add(span)
                .and_then(|d| d.next_day())
                .unwrap_or(date),
        }
    }
}

/// The identity of one load: rows matching it mean the load already happened
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NaturalKey {
    ForecastPull { site: String, pull_date: Date },
    ActualDates { site: String, window: DateWindow },
    ComparisonDates { site: String, window: DateWindow },
}

impl NaturalKey {
    pub fn table(&self) -> Table {
        match self {
            NaturalKey::ForecastPull { .. } => Table::Forecast,
            NaturalKey::ActualDates { .. } => Table::Actual,
            NaturalKey::ComparisonDates { .. } => Table::Comparison,
        }
    }

    pub fn site(&self) -> &str {
        match self {
            NaturalKey::ForecastPull { site, .. }
            | NaturalKey::ActualDates { site, .. }
            | NaturalKey::ComparisonDates { site, .. } => site,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |d: Date| format_date(d).unwrap_or_else(|_| d.to_string());
        match self {
            NaturalKey::ForecastPull { site, pull_date } => {
                write!(f, "{}/{}/{}", self.table(), site, show(*pull_date))
            }
            NaturalKey::ActualDates { site, window } | NaturalKey::ComparisonDates { site, window } => {
                write!(
                    f,
                    "{}/{}/{}..{}",
                    self.table(),
                    site,
                    show(window.start),
                    show(window.end)
                )
            }
        }
    }
}

/// Append-only tabular store reachable by simple predicate queries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WeatherStore: Send + Sync {
    /// Number of rows matching the load identity
    async fn count_matching(&self, key: &NaturalKey) -> Result<u64, StoreError>;
    /// Append rows already in `table`'s canonical column order, in one transaction
    async fn append(&self, table: Table, rows: Vec<Vec<Value>>) -> Result<u64, StoreError>;
    async fn forecast_points(
        &self,
        site: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<ForecastPoint>, StoreError>;
    async fn actual_observations(
        &self,
        site: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<ActualObservation>, StoreError>;
    async fn comparison_rows(
        &self,
        site: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<ComparisonRow>, StoreError>;
}
