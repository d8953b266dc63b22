use std::{path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use slog::{info, Logger};
use sqlx::{
    query::Query,
    sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use time::Date;
use tokio::fs::create_dir_all;

use super::{DateWindow, NaturalKey, StoreError, Table, Value, WeatherStore, FORECAST_VALUE_COLUMNS};
use crate::models::{
    format_date, parse_date, parse_timestamp, ActualObservation, ComparisonRow, ForecastPoint,
    InterpolatedRow,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path, logger: &Logger) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("synchronous", "NORMAL")
            .pragma("busy_timeout", "5000")
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(logger, "sqlite store initialized at: {}", path.display());
        Ok(store)
    }

    /// Fresh private database; a single connection that is never recycled
    /// keeps the in-memory data alive for the life of the pool.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn select(
        &self,
        table: Table,
        time_column: &str,
        site: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<SqliteRow>, StoreError> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE site_name = ?",
            table.columns().join(", "),
            table.name()
        );
        let mut bounds = Vec::new();
        if let Some(window) = window {
            sql.push_str(&format!(" AND {time_column} >= ? AND {time_column} < ?"));
            bounds.push(format_date(window.start)?);
            bounds.push(format_date(window.end)?);
        }
        sql.push_str(&format!(" ORDER BY {time_column}"));

        let mut query = sqlx::query(&sql).bind(site.to_string());
        for bound in bounds {
            query = query.bind(bound);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows)
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Integer(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
    }
}

fn date_column(row: &SqliteRow, column: &str) -> Result<Date, StoreError> {
    let raw: String = row.try_get(column)?;
    parse_date(&raw).map_err(|source| StoreError::TimeParse { value: raw, source })
}

fn timestamp_column(row: &SqliteRow, column: &str) -> Result<time::OffsetDateTime, StoreError> {
    let raw: String = row.try_get(column)?;
    parse_timestamp(&raw).map_err(|source| StoreError::TimeParse { value: raw, source })
}

fn forecast_from_row(row: &SqliteRow) -> Result<ForecastPoint, StoreError> {
    let site: String = row.try_get("site_name")?;
    let mut point = ForecastPoint::new(
        &site,
        date_column(row, "pull_date")?,
        timestamp_column(row, "forecast_time_stamps")?,
    );
    for column in FORECAST_VALUE_COLUMNS {
        point = point.with_value(column, row.try_get(column)?);
    }
    Ok(point)
}

fn actual_from_row(row: &SqliteRow) -> Result<ActualObservation, StoreError> {
    let site: String = row.try_get("site_name")?;
    Ok(ActualObservation {
        wind_raw: row.try_get("wind_raw")?,
        wind_dir: row.try_get("wind_dir")?,
        wind_speed: row.try_get("wind_speed")?,
        gust_speed: row.try_get("gust_speed")?,
        visibility: row.try_get("visibility")?,
        weather: row.try_get("weather")?,
        sky_conditions: row.try_get("sky_conditions")?,
        air_temp: row.try_get("air_temp")?,
        dew_point: row.try_get("dew_point")?,
        temp_6_hour_max: row.try_get("temp_6_hour_max")?,
        temp_6_hour_min: row.try_get("temp_6_hour_min")?,
        relative_humidity: row.try_get("relative_humidity")?,
        wind_chill: row.try_get("wind_chill")?,
        heat_index: row.try_get("heat_index")?,
        pressure: row.try_get("pressure")?,
        pressure_mb: row.try_get("pressure_mb")?,
        precip_1_hour: row.try_get("precip_1_hour")?,
        precip_3_hour: row.try_get("precip_3_hour")?,
        precip_6_hour: row.try_get("precip_6_hour")?,
        ..ActualObservation::new(&site, timestamp_column(row, "datetime")?)
    })
}

fn comparison_from_row(row: &SqliteRow) -> Result<ComparisonRow, StoreError> {
    let lead_hour: i64 = row.try_get("interp_hour")?;
    let lead_hour = u8::try_from(lead_hour).map_err(|_| StoreError::OutOfRange {
        table: Table::Comparison,
        column: "interp_hour",
        value: lead_hour,
    })?;
    Ok(ComparisonRow {
        forecast: InterpolatedRow {
            site: row.try_get("site_name")?,
            pull_date: date_column(row, "pull_date")?,
            actual_time: timestamp_column(row, "datetime")?,
            elapsed_seconds: row.try_get("interp_seconds")?,
            lead_day: row.try_get("interp_day")?,
            lead_hour,
            fcst_temperature: row.try_get("fcst_temperature")?,
            fcst_wind_speed: row.try_get("fcst_wind_speed")?,
            fcst_precip_prob: row.try_get("fcst_precip_prob")?,
        },
        air_temp: row.try_get("air_temp")?,
        wind_speed: row.try_get("wind_speed")?,
        precip_1_hour: row.try_get("precip_1_hour")?,
        temp_delta: row.try_get("temp_delta")?,
        wind_speed_delta: row.try_get("wind_speed_delta")?,
    })
}

fn row_count(table: Table, count: i64) -> Result<u64, StoreError> {
    u64::try_from(count).map_err(|_| StoreError::OutOfRange {
        table,
        column: "COUNT(*)",
        value: count,
    })
}

#[async_trait]
impl WeatherStore for SqliteStore {
    async fn count_matching(&self, key: &NaturalKey) -> Result<u64, StoreError> {
        let table = key.table().name();
        let (sql, bounds) = match key {
            NaturalKey::ForecastPull { site, pull_date } => (
                format!("SELECT COUNT(*) FROM {table} WHERE site_name = ? AND pull_date = ?"),
                vec![site.clone(), format_date(*pull_date)?],
            ),
            NaturalKey::ActualDates { site, window } | NaturalKey::ComparisonDates { site, window } => (
                format!(
                    "SELECT COUNT(*) FROM {table} WHERE site_name = ? AND datetime >= ? AND datetime < ?"
                ),
                vec![
                    site.clone(),
                    format_date(window.start)?,
                    format_date(window.end)?,
                ],
            ),
        };

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for bound in bounds {
            query = query.bind(bound);
        }
        let count = query.fetch_one(&self.pool).await?;
        row_count(key.table(), count)
    }

    async fn append(&self, table: Table, rows: Vec<Vec<Value>>) -> Result<u64, StoreError> {
        let columns = table.columns();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name(),
            columns.join(", "),
            placeholders
        );

        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for row in &rows {
            if row.len() != columns.len() {
                return Err(StoreError::RowWidth {
                    table,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            let mut query = sqlx::query(&sql);
            for value in row {
                query = bind_value(query, value);
            }
            written += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn forecast_points(
        &self,
        site: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<ForecastPoint>, StoreError> {
        self.select(Table::Forecast, "forecast_time_stamps", site, window)
            .await?
            .iter()
            .map(forecast_from_row)
            .collect()
    }

    async fn actual_observations(
        &self,
        site: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<ActualObservation>, StoreError> {
        self.select(Table::Actual, "datetime", site, window)
            .await?
            .iter()
            .map(actual_from_row)
            .collect()
    }

    async fn comparison_rows(
        &self,
        site: &str,
        window: Option<DateWindow>,
    ) -> Result<Vec<ComparisonRow>, StoreError> {
        self.select(Table::Comparison, "datetime", site, window)
            .await?
            .iter()
            .map(comparison_from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_counts_are_errors_not_zero() {
        assert_eq!(row_count(Table::Actual, 12).unwrap(), 12);
        assert!(matches!(
            row_count(Table::Actual, -1),
            Err(StoreError::OutOfRange { value: -1, .. })
        ));
    }
}
