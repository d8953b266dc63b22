//! Accuracy heatmaps: forecast vs actual (AvF) and forecast vs later forecast (FvF)
//!
//! Cells are only created from contributing samples, so a missing cell and a
//! mean of exactly 0.0 stay distinguishable all the way to the CSV/JSON output.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use slog::{warn, Logger};
use time_tz::Tz;

use nws_avf_core::to_site_time;

use crate::interpolate::{lead_day, reference_instant};
use crate::models::{delta, fields, ActualObservation, ComparisonRow, ForecastPoint, ForecastSnapshot, InterpolatedRow};

#[derive(thiserror::Error, Debug)]
pub enum HeatmapError {
    #[error("Failed to write csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to flush csv writer: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv output is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Failed to encode json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Left-join interpolated rows to actuals observed at the same instant
pub fn join_actuals(interpolated: Vec<InterpolatedRow>, actuals: &[ActualObservation]) -> Vec<ComparisonRow> {
    let mut by_instant: HashMap<i128, &ActualObservation> = HashMap::new();
    for actual in actuals {
        by_instant
            .entry(actual.observed_at.unix_timestamp_nanos())
            .or_insert(actual);
    }
    interpolated
        .into_iter()
        .map(|row| {
            let actual = by_instant.get(&row.actual_time.unix_timestamp_nanos()).copied();
            ComparisonRow::join(row, actual)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvfCell {
    pub temp_delta: Option<f64>,
    pub wind_speed_delta: Option<f64>,
    pub samples: usize,
}

/// Mean forecast-minus-actual per (lead_day, lead_hour)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvfHeatmap {
    cells: BTreeMap<(i64, u8), AvfCell>,
}

impl AvfHeatmap {
    pub fn from_comparisons(rows: &[ComparisonRow]) -> Self {
        let mut acc: BTreeMap<(i64, u8), (Mean, Mean, usize)> = BTreeMap::new();
        for row in rows {
            let key = (row.forecast.lead_day, row.forecast.lead_hour);
            if key.0 < 0 || (row.temp_delta.is_none() && row.wind_speed_delta.is_none()) {
                continue;
            }
            let (temp, wind, samples) = acc.entry(key).or_default();
            temp.push(row.temp_delta);
            wind.push(row.wind_speed_delta);
            *samples += 1;
        }

        let cells = acc
            .into_iter()
            .map(|(key, (temp, wind, samples))| {
                (
                    key,
                    AvfCell {
                        temp_delta: temp.value(),
                        wind_speed_delta: wind.value(),
                        samples,
                    },
                )
            })
            .collect();
        Self { cells }
    }

    pub fn cell(&self, lead_day: i64, lead_hour: u8) -> Option<&AvfCell> {
        self.cells.get(&(lead_day, lead_hour))
    }

    pub fn cells(&self) -> impl Iterator<Item = (&(i64, u8), &AvfCell)> {
        self.cells.iter()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn dense(&self, title: &str, pick: impl Fn(&AvfCell) -> Option<f64>) -> DenseTable {
        let mut days: Vec<i64> = self.cells.keys().map(|(day, _)| *day).collect();
        days.dedup();
        let values = days
            .iter()
            .map(|day| {
                (0..24u8)
                    .map(|hour| self.cell(*day, hour).and_then(&pick))
                    .collect()
            })
            .collect();
        DenseTable {
            title: title.to_string(),
            row_header: String::from("interp_day"),
            rows: days.iter().map(|d| d.to_string()).collect(),
            columns: (0..24).map(|h| h.to_string()).collect(),
            values,
        }
    }

    pub fn temperature_table(&self) -> DenseTable {
        self.dense("temp_delta", |c| c.temp_delta)
    }

    pub fn wind_speed_table(&self) -> DenseTable {
        self.dense("wind_speed_delta", |c| c.wind_speed_delta)
    }

    fn flat_rows(&self) -> Vec<AvfFlatRow> {
        self.cells
            .iter()
            .map(|(&(interp_day, interp_hour), cell)| AvfFlatRow {
                interp_day,
                interp_hour,
                temp_delta: cell.temp_delta,
                wind_speed_delta: cell.wind_speed_delta,
                sample_count: cell.samples,
            })
            .collect()
    }

    /// Flat export, one line per populated cell
    pub fn to_csv(&self) -> Result<String, HeatmapError> {
        write_csv(&self.flat_rows())
    }

    pub fn to_json(&self) -> Result<String, HeatmapError> {
        Ok(serde_json::to_string_pretty(&self.flat_rows())?)
    }
}

#[derive(Serialize)]
struct AvfFlatRow {
    interp_day: i64,
    interp_hour: u8,
    temp_delta: Option<f64>,
    wind_speed_delta: Option<f64>,
    sample_count: usize,
}

/// Join freshly interpolated rows to their actuals and aggregate
pub fn build_avf(comparison_rows: Vec<InterpolatedRow>, actual_rows: &[ActualObservation]) -> AvfHeatmap {
    AvfHeatmap::from_comparisons(&join_actuals(comparison_rows, actual_rows))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FvfKey {
    pub earlier_day: i64,
    pub later_day: i64,
    pub hour: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FvfCell {
    pub temp_delta: Option<f64>,
    pub precip_prob_delta: Option<f64>,
    pub wind_speed_delta: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FvfField {
    Temperature,
    PrecipProbability,
    WindSpeed,
}

impl FvfField {
    fn pick(&self, cell: &FvfCell) -> Option<f64> {
        match self {
            FvfField::Temperature => cell.temp_delta,
            FvfField::PrecipProbability => cell.precip_prob_delta,
            FvfField::WindSpeed => cell.wind_speed_delta,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            FvfField::Temperature => "temp_delta",
            FvfField::PrecipProbability => "precip_prob_delta",
            FvfField::WindSpeed => "wind_speed_delta",
        }
    }
}

/// Mean later-minus-earlier forecast revision per (earlier lead day, later lead day, hour)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FvfHeatmap {
    cells: BTreeMap<FvfKey, FvfCell>,
}

#[derive(Serialize)]
struct FvfFlatRow {
    earlier_day: i64,
    later_day: i64,
    hour: u8,
    temp_delta: Option<f64>,
    precip_prob_delta: Option<f64>,
    wind_speed_delta: Option<f64>,
    sample_count: usize,
}

impl FvfHeatmap {
    pub fn cell(&self, key: FvfKey) -> Option<&FvfCell> {
        self.cells.get(&key)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&FvfKey, &FvfCell)> {
        self.cells.iter()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Rows are "earlier-later" day pairs, columns are hours of the day
    pub fn dense(&self, field: FvfField) -> DenseTable {
        let mut pairs: Vec<(i64, i64)> = self
            .cells
            .keys()
            .map(|k| (k.earlier_day, k.later_day))
            .collect();
        pairs.dedup();
        let values = pairs
            .iter()
            .map(|&(earlier_day, later_day)| {
                (0..24u8)
                    .map(|hour| {
                        self.cell(FvfKey {
                            earlier_day,
                            later_day,
                            hour,
                        })
                        .and_then(|c| field.pick(c))
                    })
                    .collect()
            })
            .collect();
        DenseTable {
            title: field.title().to_string(),
            row_header: String::from("interp_days"),
            rows: pairs.iter().map(|(a, b)| format!("{a}-{b}")).collect(),
            columns: (0..24).map(|h| h.to_string()).collect(),
            values,
        }
    }

    fn flat_rows(&self) -> Vec<FvfFlatRow> {
        self.cells
            .iter()
            .map(|(key, cell)| FvfFlatRow {
                earlier_day: key.earlier_day,
                later_day: key.later_day,
                hour: key.hour,
                temp_delta: cell.temp_delta,
                precip_prob_delta: cell.precip_prob_delta,
                wind_speed_delta: cell.wind_speed_delta,
                sample_count: cell.samples,
            })
            .collect()
    }

    /// Flat export, one line per populated cell
    pub fn to_csv(&self) -> Result<String, HeatmapError> {
        write_csv(&self.flat_rows())
    }

    pub fn to_json(&self) -> Result<String, HeatmapError> {
        Ok(serde_json::to_string_pretty(&self.flat_rows())?)
    }
}

#[derive(Default)]
struct FvfAccumulator {
    temp: Mean,
    precip: Mean,
    wind: Mean,
    samples: usize,
}

/// Pair every forecast instant across all snapshot pairs with p1 < p2.
/// Snapshots whose pull date has no local midnight are left out.
pub fn build_fvf(snapshots: &[ForecastSnapshot], tz: &Tz, logger: &Logger) -> FvfHeatmap {
    let mut by_instant: BTreeMap<i128, Vec<(time::Date, i64, &ForecastPoint)>> = BTreeMap::new();
    for snapshot in snapshots {
        let reference = match reference_instant(snapshot.pull_date(), tz) {
            Ok(reference) => reference,
            Err(e) => {
                warn!(logger, "leaving snapshot out of fvf: {}", e; "site" => snapshot.site());
                continue;
            }
        };
        for point in snapshot.points() {
            let elapsed = (point.forecast_time - reference).whole_seconds();
            by_instant
                .entry(point.forecast_time.unix_timestamp_nanos())
                .or_default()
                .push((snapshot.pull_date(), lead_day(elapsed), point));
        }
    }

    let mut acc: BTreeMap<FvfKey, FvfAccumulator> = BTreeMap::new();
    for forecasts in by_instant.values() {
        for (pull_a, day_a, earlier) in forecasts {
            for (pull_b, day_b, later) in forecasts {
                if pull_a >= pull_b || earlier.site != later.site {
                    continue;
                }
                let key = FvfKey {
                    earlier_day: *day_a,
                    later_day: *day_b,
                    hour: to_site_time(earlier.forecast_time, tz).hour(),
                };
                let cell = acc.entry(key).or_default();
                let revision = |field: &str| delta(later.value(field), earlier.value(field));
                cell.temp.push(revision(fields::TEMPERATURE));
                cell.precip.push(revision(fields::PRECIP_PROBABILITY));
                cell.wind.push(revision(fields::WIND_SPEED));
                cell.samples += 1;
            }
        }
    }

    let cells = acc
        .into_iter()
        .map(|(key, a)| {
            (
                key,
                FvfCell {
                    temp_delta: a.temp.value(),
                    precip_prob_delta: a.precip.value(),
                    wind_speed_delta: a.wind.value(),
                    samples: a.samples,
                },
            )
        })
        .collect();
    FvfHeatmap { cells }
}

/// Row/column projection of a heatmap; `None` marks a cell with no samples
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DenseTable {
    pub title: String,
    pub row_header: String,
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Option<f64>>>,
}

impl DenseTable {
    pub fn to_csv(&self) -> Result<String, HeatmapError> {
        let mut writer = csv::Writer::from_writer(vec![]);
        let header = std::iter::once(self.row_header.as_str()).chain(self.columns.iter().map(String::as_str));
        writer.write_record(header)?;
        for (label, row) in self.rows.iter().zip(&self.values) {
            let mut record = vec![label.clone()];
            record.extend(row.iter().map(|v| v.map(|v| v.to_string()).unwrap_or_default()));
            writer.write_record(&record)?;
        }
        finish(writer)
    }

    pub fn to_json(&self) -> Result<String, HeatmapError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn write_csv<T: Serialize>(rows: &[T]) -> Result<String, HeatmapError> {
    let mut writer = csv::Writer::from_writer(vec![]);
    for row in rows {
        writer.serialize(row)?;
    }
    finish(writer)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String, HeatmapError> {
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8(bytes)?)
}
