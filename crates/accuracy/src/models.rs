use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::format_description,
    Date, OffsetDateTime,
};

pub const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
pub const CLOCK_FORMAT: &[FormatItem<'static>] = format_description!("[hour]:[minute]");

/// Forecast feed columns the interpolator reads
pub mod fields {
    pub const TEMPERATURE: &str = "temperature_hourly";
    pub const WIND_SPEED: &str = "wind_speed_sustained";
    pub const PRECIP_PROBABILITY: &str = "probability_of_precipitation_floating";
}

pub fn format_date(date: Date) -> Result<String, time::error::Format> {
    date.format(DATE_FORMAT)
}

pub fn parse_date(value: &str) -> Result<Date, time::error::Parse> {
    Date::parse(value, DATE_FORMAT)
}

pub fn format_timestamp(instant: OffsetDateTime) -> Result<String, time::error::Format> {
    instant.format(&Rfc3339)
}

pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value, &Rfc3339)
}

/// One forecast row: the values a snapshot predicts for a single instant.
/// A missing key and a `None` value both mean "not forecast".
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    pub site: String,
    pub pull_date: Date,
    pub forecast_time: OffsetDateTime,
    pub values: BTreeMap<String, Option<f64>>,
}

impl ForecastPoint {
    pub fn new(site: &str, pull_date: Date, forecast_time: OffsetDateTime) -> Self {
        Self {
            site: site.to_string(),
            pull_date,
            forecast_time,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, field: &str, value: Option<f64>) -> Self {
        self.values.insert(field.to_string(), value);
        self
    }

    pub fn value(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied().flatten()
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SnapshotError {
    #[error("duplicate forecast timestamp {timestamp} in snapshot {site}/{pull_date}")]
    DuplicateTimestamp {
        site: String,
        pull_date: Date,
        timestamp: OffsetDateTime,
    },
    #[error("point for {found_site}/{found_pull_date} does not belong to snapshot {site}/{pull_date}")]
    ForeignPoint {
        site: String,
        pull_date: Date,
        found_site: String,
        found_pull_date: Date,
    },
}

/// All forecast points sharing (site, pull_date), ascending by timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastSnapshot {
    site: String,
    pull_date: Date,
    points: Vec<ForecastPoint>,
}

impl ForecastSnapshot {
    pub fn new(
        site: &str,
        pull_date: Date,
        mut points: Vec<ForecastPoint>,
    ) -> Result<Self, SnapshotError> {
        if let Some(foreign) = points
            .iter()
            .find(|p| p.site != site || p.pull_date != pull_date)
        {
            return Err(SnapshotError::ForeignPoint {
                site: site.to_string(),
                pull_date,
                found_site: foreign.site.clone(),
                found_pull_date: foreign.pull_date,
            });
        }

        points.sort_by_key(|p| p.forecast_time);
        let mut seen = HashSet::new();
        if let Some(dup) = points
            .iter()
            .find(|p| !seen.insert(p.forecast_time.unix_timestamp_nanos()))
        {
            return Err(SnapshotError::DuplicateTimestamp {
                site: site.to_string(),
                pull_date,
                timestamp: dup.forecast_time,
            });
        }

        Ok(Self {
            site: site.to_string(),
            pull_date,
            points,
        })
    }

    /// Split stored rows into one snapshot per (site, pull_date), oldest pull
    /// first. An inconsistent snapshot comes back as its own error and does
    /// not affect the others.
    pub fn group(points: Vec<ForecastPoint>) -> Vec<Result<ForecastSnapshot, SnapshotError>> {
        let mut grouped: BTreeMap<(String, Date), Vec<ForecastPoint>> = BTreeMap::new();
        for point in points {
            grouped
                .entry((point.site.clone(), point.pull_date))
                .or_default()
                .push(point);
        }
        grouped
            .into_iter()
            .map(|((site, pull_date), points)| ForecastSnapshot::new(&site, pull_date, points))
            .collect()
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn pull_date(&self) -> Date {
        self.pull_date
    }

    pub fn points(&self) -> &[ForecastPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A station report, `observed_at` already resolved into the site timezone
#[derive(Debug, Clone, PartialEq)]
pub struct ActualObservation {
    pub site: String,
    pub observed_at: OffsetDateTime,
    pub wind_raw: Option<String>,
    pub wind_dir: Option<String>,
    pub wind_speed: Option<f64>,
    pub gust_speed: Option<f64>,
    pub visibility: Option<f64>,
    pub weather: Option<String>,
    pub sky_conditions: Option<String>,
    pub air_temp: Option<f64>,
    pub dew_point: Option<f64>,
    pub temp_6_hour_max: Option<f64>,
    pub temp_6_hour_min: Option<f64>,
    pub relative_humidity: Option<f64>,
    pub wind_chill: Option<f64>,
    pub heat_index: Option<f64>,
    pub pressure: Option<f64>,
    pub pressure_mb: Option<f64>,
    pub precip_1_hour: Option<f64>,
    pub precip_3_hour: Option<f64>,
    pub precip_6_hour: Option<f64>,
}

impl ActualObservation {
    pub fn new(site: &str, observed_at: OffsetDateTime) -> Self {
        Self {
            site: site.to_string(),
            observed_at,
            wind_raw: None,
            wind_dir: None,
            wind_speed: None,
            gust_speed: None,
            visibility: None,
            weather: None,
            sky_conditions: None,
            air_temp: None,
            dew_point: None,
            temp_6_hour_max: None,
            temp_6_hour_min: None,
            relative_humidity: None,
            wind_chill: None,
            heat_index: None,
            pressure: None,
            pressure_mb: None,
            precip_1_hour: None,
            precip_3_hour: None,
            precip_6_hour: None,
        }
    }
}

/// Forecast values of one snapshot evaluated at one actual timestamp
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterpolatedRow {
    pub site: String,
    #[serde(serialize_with = "serialize_date")]
    pub pull_date: Date,
    #[serde(with = "time::serde::rfc3339")]
    pub actual_time: OffsetDateTime,
    pub elapsed_seconds: i64,
    pub lead_day: i64,
    pub lead_hour: u8,
    pub fcst_temperature: Option<f64>,
    pub fcst_wind_speed: Option<f64>,
    pub fcst_precip_prob: Option<f64>,
}

/// An interpolated row left-joined to the actual observed at the same instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    #[serde(flatten)]
    pub forecast: InterpolatedRow,
    pub air_temp: Option<f64>,
    pub wind_speed: Option<f64>,
    pub precip_1_hour: Option<f64>,
    pub temp_delta: Option<f64>,
    pub wind_speed_delta: Option<f64>,
}

impl ComparisonRow {
    pub fn join(forecast: InterpolatedRow, actual: Option<&ActualObservation>) -> Self {
        let air_temp = actual.and_then(|a| a.air_temp);
        let wind_speed = actual.and_then(|a| a.wind_speed);
        let precip_1_hour = actual.and_then(|a| a.precip_1_hour);
        Self {
            temp_delta: delta(forecast.fcst_temperature, air_temp),
            wind_speed_delta: delta(forecast.fcst_wind_speed, wind_speed),
            forecast,
            air_temp,
            wind_speed,
            precip_1_hour,
        }
    }
}

pub(crate) fn delta(forecast: Option<f64>, actual: Option<f64>) -> Option<f64> {
    Some(forecast? - actual?)
}

fn serialize_date<S: serde::Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
    let formatted = format_date(*date).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}
