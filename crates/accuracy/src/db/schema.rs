//! Canonical column lists and the reconciliation of loosely-shaped records onto them

use time::OffsetDateTime;

use super::{Record, StoreError, Table, Value};
use crate::models::{
    format_date, format_timestamp, ActualObservation, ComparisonRow, ForecastPoint, CLOCK_FORMAT,
};

pub const ACTUAL_COLUMNS: [&str; 23] = [
    "datetime",
    "date",
    "time",
    "wind_raw",
    "wind_dir",
    "wind_speed",
    "gust_speed",
    "visibility",
    "weather",
    "sky_conditions",
    "air_temp",
    "dew_point",
    "temp_6_hour_max",
    "temp_6_hour_min",
    "relative_humidity",
    "wind_chill",
    "heat_index",
    "pressure",
    "pressure_mb",
    "precip_1_hour",
    "precip_3_hour",
    "precip_6_hour",
    "site_name",
];

pub const FORECAST_COLUMNS: [&str; 13] = [
    "site_name",
    "pull_date",
    "forecast_time_stamps",
    "temperature_dew_point",
    "temperature_heat_index",
    "wind_speed_sustained",
    "cloud_amount_total",
    "probability_of_precipitation_floating",
    "humidity_relative",
    "direction_wind",
    "temperature_hourly",
    "wind_speed_gust",
    "hourly_qpf_floating",
];

/// The forecast columns holding numeric series values
pub const FORECAST_VALUE_COLUMNS: [&str; 10] = [
    "temperature_dew_point",
    "temperature_heat_index",
    "wind_speed_sustained",
    "cloud_amount_total",
    "probability_of_precipitation_floating",
    "humidity_relative",
    "direction_wind",
    "temperature_hourly",
    "wind_speed_gust",
    "hourly_qpf_floating",
];

pub const COMPARISON_COLUMNS: [&str; 14] = [
    "site_name",
    "pull_date",
    "datetime",
    "interp_seconds",
    "interp_day",
    "interp_hour",
    "fcst_temperature",
    "fcst_wind_speed",
    "fcst_precip_prob",
    "air_temp",
    "wind_speed",
    "precip_1_hour",
    "temp_delta",
    "wind_speed_delta",
];

/// A record laid out in canonical column order
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub values: Vec<Value>,
    /// Columns present in the record but unknown to the table
    pub dropped: Vec<String>,
}

/// Absent columns become null, unknown columns are dropped, order is canonical.
pub fn reconcile(table: Table, mut record: Record) -> Reconciled {
    let values = table
        .columns()
        .iter()
        .map(|column| record.remove(*column).unwrap_or(Value::Null))
        .collect();
    let mut dropped: Vec<String> = record.into_keys().collect();
    dropped.sort();
    Reconciled { values, dropped }
}

fn timestamp(instant: OffsetDateTime) -> Result<Value, StoreError> {
    Ok(Value::Text(format_timestamp(instant)?))
}

impl TryFrom<&ForecastPoint> for Record {
    type Error = StoreError;

    fn try_from(point: &ForecastPoint) -> Result<Self, Self::Error> {
        let mut record = Record::new();
        record.insert("site_name".into(), point.site.as_str().into());
        record.insert("pull_date".into(), format_date(point.pull_date)?.into());
        record.insert("forecast_time_stamps".into(), timestamp(point.forecast_time)?);
        for (field, value) in &point.values {
            record.insert(field.clone(), (*value).into());
        }
        Ok(record)
    }
}

impl TryFrom<&ActualObservation> for Record {
    type Error = StoreError;

    fn try_from(obs: &ActualObservation) -> Result<Self, Self::Error> {
        let local = obs.observed_at;
        let text = |v: &Option<String>| Value::from(v.clone());
        Ok(Record::from([
            ("datetime".to_string(), timestamp(local)?),
            ("date".to_string(), format_date(local.date())?.into()),
            ("time".to_string(), local.time().format(CLOCK_FORMAT)?.into()),
            ("wind_raw".to_string(), text(&obs.wind_raw)),
            ("wind_dir".to_string(), text(&obs.wind_dir)),
            ("wind_speed".to_string(), obs.wind_speed.into()),
            ("gust_speed".to_string(), obs.gust_speed.into()),
            ("visibility".to_string(), obs.visibility.into()),
            ("weather".to_string(), text(&obs.weather)),
            ("sky_conditions".to_string(), text(&obs.sky_conditions)),
            ("air_temp".to_string(), obs.air_temp.into()),
            ("dew_point".to_string(), obs.dew_point.into()),
            ("temp_6_hour_max".to_string(), obs.temp_6_hour_max.into()),
            ("temp_6_hour_min".to_string(), obs.temp_6_hour_min.into()),
            ("relative_humidity".to_string(), obs.relative_humidity.into()),
            ("wind_chill".to_string(), obs.wind_chill.into()),
            ("heat_index".to_string(), obs.heat_index.into()),
            ("pressure".to_string(), obs.pressure.into()),
            ("pressure_mb".to_string(), obs.pressure_mb.into()),
            ("precip_1_hour".to_string(), obs.precip_1_hour.into()),
            ("precip_3_hour".to_string(), obs.precip_3_hour.into()),
            ("precip_6_hour".to_string(), obs.precip_6_hour.into()),
            ("site_name".to_string(), obs.site.as_str().into()),
        ]))
    }
}

impl TryFrom<&ComparisonRow> for Record {
    type Error = StoreError;

    fn try_from(row: &ComparisonRow) -> Result<Self, Self::Error> {
        let fcst = &row.forecast;
        Ok(Record::from([
            ("site_name".to_string(), fcst.site.as_str().into()),
            ("pull_date".to_string(), format_date(fcst.pull_date)?.into()),
            ("datetime".to_string(), timestamp(fcst.actual_time)?),
            ("interp_seconds".to_string(), fcst.elapsed_seconds.into()),
            ("interp_day".to_string(), fcst.lead_day.into()),
            ("interp_hour".to_string(), i64::from(fcst.lead_hour).into()),
            ("fcst_temperature".to_string(), fcst.fcst_temperature.into()),
            ("fcst_wind_speed".to_string(), fcst.fcst_wind_speed.into()),
            ("fcst_precip_prob".to_string(), fcst.fcst_precip_prob.into()),
            ("air_temp".to_string(), row.air_temp.into()),
            ("wind_speed".to_string(), row.wind_speed.into()),
            ("precip_1_hour".to_string(), row.precip_1_hour.into()),
            ("temp_delta".to_string(), row.temp_delta.into()),
            ("wind_speed_delta".to_string(), row.wind_speed_delta.into()),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn reconcile_fills_drops_and_orders() {
        let mut record = Record::new();
        record.insert("temperature_hourly".into(), Value::Real(71.0));
        record.insert("site_name".into(), "KORD".into());
        record.insert("pull_date".into(), "2019-08-13".into());
        record.insert("forecast_time_stamps".into(), "2019-08-13T01:00:00-05:00".into());
        record.insert("sunshine_minutes".into(), Value::Real(12.0));

        let reconciled = reconcile(Table::Forecast, record);
        assert_eq!(reconciled.values.len(), FORECAST_COLUMNS.len());
        assert_eq!(reconciled.values[0], Value::Text("KORD".into()));
        assert_eq!(reconciled.values[3], Value::Null);
        assert_eq!(reconciled.values[10], Value::Real(71.0));
        assert_eq!(reconciled.dropped, vec!["sunshine_minutes".to_string()]);
    }

    #[test]
    fn actual_date_and_time_follow_the_local_timestamp() {
        let obs = ActualObservation {
            air_temp: Some(68.0),
            ..ActualObservation::new("KORD", datetime!(2019-11-03 01:53 -6))
        };
        let record = Record::try_from(&obs).unwrap();
        assert_eq!(record["date"], Value::Text("2019-11-03".into()));
        assert_eq!(record["time"], Value::Text("01:53".into()));
        assert_eq!(
            record["datetime"],
            Value::Text("2019-11-03T01:53:00-06:00".into())
        );

        let reconciled = reconcile(Table::Actual, record);
        assert!(reconciled.dropped.is_empty());
        assert_eq!(reconciled.values[22], Value::Text("KORD".into()));
    }

    #[test]
    fn forecast_values_map_to_their_columns() {
        let point = ForecastPoint::new("KORD", date!(2019 - 08 - 13), datetime!(2019-08-13 01:00 -5))
            .with_value("wind_speed_sustained", Some(9.0))
            .with_value("cloud_amount_total", None);
        let reconciled = reconcile(Table::Forecast, Record::try_from(&point).unwrap());
        assert_eq!(reconciled.values[5], Value::Real(9.0));
        assert_eq!(reconciled.values[6], Value::Null);
    }
}
