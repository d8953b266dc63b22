//! Evaluates a forecast snapshot at the instants actuals were observed.
//!
//! Elapsed time is measured from local midnight of the pull date in the
//! site timezone. Subtraction happens on absolute instants, so a snapshot
//! that spans a DST transition still yields one elapsed second per real
//! second.

use time::{Date, OffsetDateTime};
use time_tz::{TimeZone, Tz};

use nws_avf_core::{local_midnight, to_site_time};

use crate::models::{fields, ForecastSnapshot, InterpolatedRow};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum InterpolationError {
    #[error("snapshot {site}/{pull_date} has {points} forecast points, at least 2 are required")]
    InsufficientData {
        site: String,
        pull_date: Date,
        points: usize,
    },
    #[error("midnight of {pull_date} does not exist in {zone}")]
    NoReferenceMidnight { pull_date: Date, zone: String },
}

/// Piecewise-linear interpolant over strictly increasing sample positions.
/// Outside the sampled range the first/last segment is extended.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearInterpolant {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl LinearInterpolant {
    /// `None` with fewer than two distinct positions
    pub fn new(samples: impl IntoIterator<Item = (f64, f64)>) -> Option<Self> {
        let mut samples: Vec<(f64, f64)> = samples
            .into_iter()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .collect();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        samples.dedup_by(|later, earlier| later.0 == earlier.0);
        if samples.len() < 2 {
            return None;
        }
        let (xs, ys) = samples.into_iter().unzip();
        Some(Self { xs, ys })
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let last = self.xs.len() - 1;
        let upper = self.xs.partition_point(|&v| v <= x).clamp(1, last);
        let (x0, x1) = (self.xs[upper - 1], self.xs[upper]);
        let (y0, y1) = (self.ys[upper - 1], self.ys[upper]);
        y0 + (x - x0) * (y1 - y0) / (x1 - x0)
    }
}

/// The instant a snapshot's lead times are counted from
pub fn reference_instant(pull_date: Date, tz: &Tz) -> Result<OffsetDateTime, InterpolationError> {
    local_midnight(pull_date, tz).ok_or_else(|| InterpolationError::NoReferenceMidnight {
        pull_date,
        zone: tz.name().to_string(),
    })
}

pub fn lead_day(elapsed_seconds: i64) -> i64 {
    elapsed_seconds.div_euclid(SECONDS_PER_DAY)
}

fn field_interpolant(snapshot: &ForecastSnapshot, reference: OffsetDateTime, field: &str) -> Option<LinearInterpolant> {
    LinearInterpolant::new(snapshot.points().iter().filter_map(|point| {
        let value = point.value(field)?;
        Some(((point.forecast_time - reference).whole_seconds() as f64, value))
    }))
}

/// One row per actual instant that falls inside the snapshot's forecast horizon.
pub fn interpolate(
    snapshot: &ForecastSnapshot,
    tz: &Tz,
    actual_times: &[OffsetDateTime],
) -> Result<Vec<InterpolatedRow>, InterpolationError> {
    if snapshot.len() < 2 {
        return Err(InterpolationError::InsufficientData {
            site: snapshot.site().to_string(),
            pull_date: snapshot.pull_date(),
            points: snapshot.len(),
        });
    }

    let reference = reference_instant(snapshot.pull_date(), tz)?;
    let elapsed: Vec<i64> = snapshot
        .points()
        .iter()
        .map(|p| (p.forecast_time - reference).whole_seconds())
        .collect();
    let (Some(&min), Some(&max)) = (elapsed.iter().min(), elapsed.iter().max()) else {
        return Ok(Vec::new());
    };

    let temperature = field_interpolant(snapshot, reference, fields::TEMPERATURE);
    let wind_speed = field_interpolant(snapshot, reference, fields::WIND_SPEED);
    let precip = field_interpolant(snapshot, reference, fields::PRECIP_PROBABILITY);
    let at = |interpolant: &Option<LinearInterpolant>, x: i64| {
        interpolant.as_ref().map(|i| i.evaluate(x as f64))
    };

    let rows = actual_times
        .iter()
        .filter_map(|&actual| {
            let seconds = (actual - reference).whole_seconds();
            if seconds < min || seconds > max {
                return None;
            }
            Some(InterpolatedRow {
                site: snapshot.site().to_string(),
                pull_date: snapshot.pull_date(),
                actual_time: actual,
                elapsed_seconds: seconds,
                lead_day: lead_day(seconds),
                lead_hour: to_site_time(actual, tz).hour(),
                fcst_temperature: at(&temperature, seconds),
                fcst_wind_speed: at(&wind_speed, seconds),
                fcst_precip_prob: at(&precip, seconds),
            })
        })
        .collect();
    Ok(rows)
}
