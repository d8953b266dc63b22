use slog::{debug, info, warn, Logger};
use time::Date;

use nws_avf_core::Site;

use crate::db::{DateWindow, NaturalKey, StoreError, WeatherStore};
use crate::heatmap::{build_fvf, join_actuals, AvfHeatmap, FvfHeatmap};
use crate::ingest::{IngestOutcome, Ingestor, RowBatch};
use crate::interpolate::{interpolate, InterpolationError};
use crate::models::{format_date, ForecastPoint, ForecastSnapshot};

#[derive(thiserror::Error, Debug)]
pub enum AggregationError {
    #[error("store access failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompareOutcome {
    Ingested(IngestOutcome),
    /// Not enough stored data yet; retried on a later cycle
    Skipped { reason: String },
}

/// Builds comparison rows for a date and reads heatmaps back out of the store
pub struct AccuracyService {
    logger: Logger,
}

impl AccuracyService {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }

    /// Interpolate every snapshot around `date` onto that day's actuals and
    /// store the joined rows.
    pub async fn compare_date(
        &self,
        store: &dyn WeatherStore,
        ingestor: &Ingestor,
        site: &Site,
        date: Date,
    ) -> Result<CompareOutcome, AggregationError> {
        let logger = self.logger.new(slog::o!("site" => site.name().to_string()));
        let day = format_date(date).map_err(StoreError::from)?;

        let key = NaturalKey::ComparisonDates {
            site: site.name().to_string(),
            window: DateWindow::day(date),
        };
        let existing = store.count_matching(&key).await?;
        if existing > 0 {
            info!(logger, "comparison already loaded for {}", day);
            return Ok(CompareOutcome::Ingested(IngestOutcome::AlreadyLoaded {
                table: key.table(),
                existing,
            }));
        }

        let actuals = store
            .actual_observations(site.name(), Some(DateWindow::day(date)))
            .await?;
        if actuals.len() < 2 {
            return Ok(skip(&logger, format!("{} actuals on {}", actuals.len(), day)));
        }

        let points = store
            .forecast_points(site.name(), Some(DateWindow::around(date, 1)))
            .await?;
        if points.len() < 2 {
            return Ok(skip(&logger, format!("{} forecast points around {}", points.len(), day)));
        }

        let actual_times: Vec<_> = actuals.iter().map(|a| a.observed_at).collect();
        let mut interpolated = Vec::new();
        for snapshot in usable_snapshots(&logger, points) {
            match interpolate(&snapshot, site.tz, &actual_times) {
                Ok(rows) => interpolated.extend(rows),
                Err(e @ InterpolationError::InsufficientData { .. }) => debug!(logger, "{}", e),
                Err(e) => warn!(logger, "skipping snapshot: {}", e),
            }
        }

        let rows = join_actuals(interpolated, &actuals);
        let outcome = ingestor
            .ingest(store, site.name(), RowBatch::Comparison { date, rows })
            .await?;
        Ok(CompareOutcome::Ingested(outcome))
    }

    pub async fn avf_heatmap(
        &self,
        store: &dyn WeatherStore,
        site: &Site,
    ) -> Result<AvfHeatmap, AggregationError> {
        let rows = store.comparison_rows(site.name(), None).await?;
        debug!(self.logger, "building avf heatmap"; "site" => site.name(), "rows" => rows.len());
        Ok(AvfHeatmap::from_comparisons(&rows))
    }

    pub async fn fvf_heatmap(
        &self,
        store: &dyn WeatherStore,
        site: &Site,
    ) -> Result<FvfHeatmap, AggregationError> {
        let points = store.forecast_points(site.name(), None).await?;
        debug!(self.logger, "building fvf heatmap"; "site" => site.name(), "points" => points.len());
        let snapshots = usable_snapshots(&self.logger, points);
        Ok(build_fvf(&snapshots, site.tz, &self.logger))
    }
}

/// Snapshots that fail validation are logged and left out
fn usable_snapshots(logger: &Logger, points: Vec<ForecastPoint>) -> Vec<ForecastSnapshot> {
    ForecastSnapshot::group(points)
        .into_iter()
        .filter_map(|snapshot| match snapshot {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(logger, "skipping stored snapshot: {}", e);
                None
            }
        })
        .collect()
}

fn skip(logger: &Logger, reason: String) -> CompareOutcome {
    info!(logger, "not enough data to compare, skipping"; "reason" => &reason);
    CompareOutcome::Skipped { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockWeatherStore;
    use crate::models::ActualObservation;
    use nws_avf_core::{SiteProfile, TimezoneTable};
    use time::macros::{date, datetime};

    fn site() -> Site {
        Site::resolve(
            SiteProfile {
                name: "KORD".into(),
                timezone: "America/Chicago".into(),
                forecast_url: "https://example.invalid/fcst".into(),
                actual_url_template: "https://example.invalid/{site}".into(),
                city: None,
                state: None,
            },
            &TimezoneTable::builtin(),
        )
        .unwrap()
    }

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn a_single_actual_is_a_soft_skip() {
        let mut store = MockWeatherStore::new();
        store.expect_count_matching().returning(|_| Ok(0));
        store.expect_actual_observations().returning(|_, _| {
            Ok(vec![ActualObservation::new("KORD", datetime!(2019-08-13 00:53 -5))])
        });
        store.expect_forecast_points().never();
        store.expect_append().never();

        let outcome = AccuracyService::new(logger())
            .compare_date(&store, &Ingestor::new(logger()), &site(), date!(2019 - 08 - 13))
            .await
            .unwrap();
        assert!(matches!(outcome, CompareOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn loaded_dates_are_not_recomputed() {
        let mut store = MockWeatherStore::new();
        store.expect_count_matching().returning(|_| Ok(24));
        store.expect_actual_observations().never();

        let outcome = AccuracyService::new(logger())
            .compare_date(&store, &Ingestor::new(logger()), &site(), date!(2019 - 08 - 13))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompareOutcome::Ingested(IngestOutcome::AlreadyLoaded { existing: 24, .. })
        ));
    }
}
