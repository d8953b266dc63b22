use accuracy::{
    fields, reconcile, AccuracyService, ActualObservation, CompareOutcome, DateWindow,
    ForecastPoint, FvfKey, IngestOutcome, Ingestor, Record, RowBatch, SqliteStore, Table,
    WeatherStore,
};
use nws_avf_core::{local_midnight, Site, SiteProfile, TimezoneTable};
use slog::{o, Discard, Logger};
use time::{macros::date, Date, Duration, OffsetDateTime};

fn logger() -> Logger {
    Logger::root(Discard, o!())
}

fn kord() -> Site {
    Site::resolve(
        SiteProfile {
            name: "KORD".into(),
            timezone: "America/Chicago".into(),
            forecast_url: "https://example.invalid/fcst".into(),
            actual_url_template: "https://example.invalid/{site}".into(),
            city: Some("Chicago".into()),
            state: Some("IL".into()),
        },
        &TimezoneTable::builtin(),
    )
    .expect("chicago resolves")
}

fn at(site: &Site, date: Date, minutes: i64) -> OffsetDateTime {
    local_midnight(date, site.tz).expect("midnight exists") + Duration::minutes(minutes)
}

fn forecast(
    site: &Site,
    pull_date: Date,
    series: &[(i64, f64, Option<f64>, f64)],
) -> RowBatch {
    let points = series
        .iter()
        .map(|&(minutes, temp, wind, precip)| {
            ForecastPoint::new(site.name(), pull_date, at(site, date!(2019 - 08 - 13), minutes))
                .with_value(fields::TEMPERATURE, Some(temp))
                .with_value(fields::WIND_SPEED, wind)
                .with_value(fields::PRECIP_PROBABILITY, Some(precip))
        })
        .collect();
    RowBatch::Forecast { pull_date, points }
}

fn actual(site: &Site, minutes: i64, air_temp: f64, wind: f64) -> ActualObservation {
    ActualObservation {
        wind_raw: Some(format!("S {wind}")),
        wind_dir: Some("S".into()),
        wind_speed: Some(wind),
        air_temp: Some(air_temp),
        relative_humidity: Some(61.0),
        ..ActualObservation::new(site.name(), at(site, date!(2019 - 08 - 13), minutes))
    }
}

async fn seeded_store(site: &Site, ingestor: &Ingestor) -> SqliteStore {
    let store = SqliteStore::in_memory().await.expect("in-memory store");

    let today = forecast(
        site,
        date!(2019 - 08 - 13),
        &[
            (0, 70.0, Some(10.0), 0.0),
            (60, 72.0, Some(10.0), 20.0),
            (120, 74.0, Some(10.0), 40.0),
        ],
    );
    let yesterday = forecast(
        site,
        date!(2019 - 08 - 12),
        &[(0, 68.0, None, 10.0), (120, 72.0, None, 10.0)],
    );
    let actuals = RowBatch::Actual {
        date: date!(2019 - 08 - 13),
        observations: vec![actual(site, 30, 70.0, 8.0), actual(site, 90, 72.0, 12.0)],
    };

    for batch in [today, yesterday, actuals] {
        let outcome = ingestor
            .ingest(&store, site.name(), batch)
            .await
            .expect("ingest succeeds");
        assert!(matches!(outcome, IngestOutcome::Loaded { .. }));
    }
    store
}

#[tokio::test]
async fn second_load_of_a_pull_date_is_skipped() {
    let site = kord();
    let ingestor = Ingestor::new(logger());
    let store = SqliteStore::in_memory().await.unwrap();
    let batch = forecast(
        &site,
        date!(2019 - 08 - 13),
        &[(0, 70.0, Some(10.0), 0.0), (60, 72.0, Some(10.0), 20.0)],
    );

    let first = ingestor.ingest(&store, "KORD", batch.clone()).await.unwrap();
    assert_eq!(
        first,
        IngestOutcome::Loaded {
            table: Table::Forecast,
            rows: 2
        }
    );

    let second = ingestor.ingest(&store, "KORD", batch).await.unwrap();
    assert_eq!(
        second,
        IngestOutcome::AlreadyLoaded {
            table: Table::Forecast,
            existing: 2
        }
    );
    assert_eq!(store.forecast_points("KORD", None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_loads_of_one_key_write_once() {
    let site = kord();
    let ingestor = Ingestor::new(logger());
    let store = SqliteStore::in_memory().await.unwrap();
    let batch = RowBatch::Actual {
        date: date!(2019 - 08 - 13),
        observations: vec![actual(&site, 30, 70.0, 8.0), actual(&site, 90, 72.0, 12.0)],
    };

    let (a, b) = tokio::join!(
        ingestor.ingest(&store, "KORD", batch.clone()),
        ingestor.ingest(&store, "KORD", batch.clone()),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, IngestOutcome::Loaded { .. }))
            .count(),
        1
    );
    assert_eq!(store.actual_observations("KORD", None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn actuals_come_back_in_the_site_timezone() {
    let site = kord();
    let ingestor = Ingestor::new(logger());
    let store = seeded_store(&site, &ingestor).await;

    let stored = store
        .actual_observations("KORD", Some(DateWindow::day(date!(2019 - 08 - 13))))
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0], actual(&site, 30, 70.0, 8.0));
    assert_eq!(stored[0].observed_at.offset().whole_hours(), -5);

    let other_day = store
        .actual_observations("KORD", Some(DateWindow::day(date!(2019 - 08 - 14))))
        .await
        .unwrap();
    assert!(other_day.is_empty());
}

#[tokio::test]
async fn comparison_rows_feed_the_avf_heatmap() {
    let site = kord();
    let ingestor = Ingestor::new(logger());
    let store = seeded_store(&site, &ingestor).await;
    let service = AccuracyService::new(logger());

    let outcome = service
        .compare_date(&store, &ingestor, &site, date!(2019 - 08 - 13))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompareOutcome::Ingested(IngestOutcome::Loaded {
            table: Table::Comparison,
            rows: 4
        })
    );

    let again = service
        .compare_date(&store, &ingestor, &site, date!(2019 - 08 - 13))
        .await
        .unwrap();
    assert!(matches!(
        again,
        CompareOutcome::Ingested(IngestOutcome::AlreadyLoaded { .. })
    ));

    let heatmap = service.avf_heatmap(&store, &site).await.unwrap();
    let first_hour = heatmap.cell(0, 0).unwrap();
    assert_eq!(first_hour.temp_delta, Some(1.0));
    assert_eq!(first_hour.wind_speed_delta, Some(2.0));

    let second_hour = heatmap.cell(0, 1).unwrap();
    assert_eq!(second_hour.temp_delta, Some(1.0));
    assert_eq!(second_hour.wind_speed_delta, Some(-2.0));

    // the day-old pull forecast no wind at all
    let day_old = heatmap.cell(1, 0).unwrap();
    assert_eq!(day_old.temp_delta, Some(-1.0));
    assert_eq!(day_old.wind_speed_delta, None);
    assert!(heatmap.cell(1, 2).is_none());
}

#[tokio::test]
async fn compare_without_actuals_is_a_soft_skip() {
    let site = kord();
    let ingestor = Ingestor::new(logger());
    let store = seeded_store(&site, &ingestor).await;

    let outcome = AccuracyService::new(logger())
        .compare_date(&store, &ingestor, &site, date!(2019 - 08 - 20))
        .await
        .unwrap();
    assert!(matches!(outcome, CompareOutcome::Skipped { .. }));
}

#[tokio::test]
async fn fvf_heatmap_tracks_revisions_between_pulls() {
    let site = kord();
    let ingestor = Ingestor::new(logger());
    let store = seeded_store(&site, &ingestor).await;

    let heatmap = AccuracyService::new(logger())
        .fvf_heatmap(&store, &site)
        .await
        .unwrap();
    assert_eq!(heatmap.len(), 2);
    for hour in [0, 2] {
        let cell = heatmap
            .cell(FvfKey {
                earlier_day: 1,
                later_day: 0,
                hour,
            })
            .unwrap();
        assert_eq!(cell.temp_delta, Some(2.0));
        assert_eq!(cell.precip_prob_delta, Some(if hour == 0 { -10.0 } else { 30.0 }));
        assert_eq!(cell.samples, 1);
    }
}

/// Seeded store plus a 2019-08-14 pull that repeats local midnight, written
/// straight to the table the way an older build could have left it
async fn store_with_a_repeated_instant(site: &Site, ingestor: &Ingestor) -> SqliteStore {
    let store = seeded_store(site, ingestor).await;
    let pull_date = date!(2019 - 08 - 14);
    let midnight = at(site, date!(2019 - 08 - 13), 0);
    let rows = [(midnight, 60.0), (midnight, 61.0), (midnight + Duration::hours(1), 62.0)]
        .iter()
        .map(|&(instant, temp)| {
            let point = ForecastPoint::new(site.name(), pull_date, instant)
                .with_value(fields::TEMPERATURE, Some(temp));
            reconcile(Table::Forecast, Record::try_from(&point).expect("record")).values
        })
        .collect();
    store.append(Table::Forecast, rows).await.expect("raw append");
    store
}

#[tokio::test]
async fn a_forecast_feed_with_repeated_instants_is_not_stored() {
    let site = kord();
    let ingestor = Ingestor::new(logger());
    let store = SqliteStore::in_memory().await.unwrap();
    let pull_date = date!(2019 - 08 - 13);
    let midnight = at(&site, pull_date, 0);
    let batch = RowBatch::Forecast {
        pull_date,
        points: vec![
            ForecastPoint::new("KORD", pull_date, midnight),
            ForecastPoint::new("KORD", pull_date, midnight),
            ForecastPoint::new("KORD", pull_date, midnight + Duration::hours(1)),
        ],
    };

    let outcome = ingestor.ingest(&store, "KORD", batch).await.unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Rejected {
            table: Table::Forecast,
            ..
        }
    ));
    assert!(store.forecast_points("KORD", None).await.unwrap().is_empty());

    // the next cycle can still load a clean pull for that date
    let clean = forecast(
        &site,
        pull_date,
        &[(0, 70.0, Some(10.0), 0.0), (60, 72.0, Some(10.0), 20.0)],
    );
    assert!(matches!(
        ingestor.ingest(&store, "KORD", clean).await.unwrap(),
        IngestOutcome::Loaded { rows: 2, .. }
    ));
}

#[tokio::test]
async fn a_bad_stored_snapshot_does_not_block_the_good_ones() {
    let site = kord();
    let ingestor = Ingestor::new(logger());
    let store = store_with_a_repeated_instant(&site, &ingestor).await;
    let service = AccuracyService::new(logger());

    let outcome = service
        .compare_date(&store, &ingestor, &site, date!(2019 - 08 - 13))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CompareOutcome::Ingested(IngestOutcome::Loaded {
            table: Table::Comparison,
            rows: 4
        })
    );

    let fvf = service.fvf_heatmap(&store, &site).await.unwrap();
    assert_eq!(fvf.len(), 2);
}
