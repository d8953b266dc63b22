use std::{sync::Arc, time::Duration};

use accuracy::{
    fields, AccuracyService, ForecastPoint, IngestOutcome, Ingestor, RowBatch, SqliteStore, Table,
    WeatherStore,
};
use daemon::{
    BatchRunner, DelayRange, FetchSettings, PolitenessGate, ResilientFetcher, StepOutcome,
};
use nws_avf_core::{Site, SiteProfile, TimezoneTable};
use slog::{o, Discard, Logger};
use time::macros::{date, datetime};
use time::OffsetDateTime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn logger() -> Logger {
    Logger::root(Discard, o!())
}

fn kord(server: &MockServer) -> Site {
    Site::resolve(
        SiteProfile {
            name: "KORD".into(),
            timezone: "America/Chicago".into(),
            forecast_url: format!("{}/MapClick.php", server.uri()),
            actual_url_template: format!("{}/data/obhistory/{{site}}.html", server.uri()),
            city: Some("Chicago".into()),
            state: Some("IL".into()),
        },
        &TimezoneTable::builtin(),
    )
    .unwrap()
}

const DWML: &str = r#"<?xml version="1.0"?>
<dwml version="1.0">
  <data>
    <time-layout time-coordinate="local">
      <layout-key>k-p1h-n2-0</layout-key>
      <start-valid-time>2019-08-13T01:00:00-05:00</start-valid-time>
      <start-valid-time>2019-08-13T02:00:00-05:00</start-valid-time>
    </time-layout>
    <parameters applicable-location="point1">
      <temperature type="hourly"><value>75</value><value>74</value></temperature>
      <wind-speed type="sustained"><value>9</value><value>9</value></wind-speed>
      <probability-of-precipitation type="floating"><value>0</value><value>5</value></probability-of-precipitation>
    </parameters>
  </data>
</dwml>"#;

fn obhistory() -> String {
    let rows = [("23:00", "S 12", "75"), ("22:00", "Calm", "72"), ("21:00", "S 8", "69")]
        .iter()
        .map(|&(clock, wind, temp)| {
            let cells = [
                "12", clock, wind, "10.00", "Fair", "CLR", temp, "60", "", "", "61%", "NA", "NA",
                "30.01", "1016.2", "", "", "",
            ];
            let tds: String = cells.iter().map(|c| format!("<td>{c}</td>")).collect();
            format!("<tr>{tds}</tr>")
        })
        .collect::<String>();
    format!(
        "<html><body><table><tr><th>Date</th><th>Time<br>(cdt)</th></tr>{rows}</table></body></html>"
    )
}

/// Yesterday's pull, already in the store
fn previous_pull() -> RowBatch {
    let points = [(21, 70.0), (22, 72.0), (23, 74.0)]
        .iter()
        .map(|&(hour, temp)| {
            let at = datetime!(2019-08-12 00:00 -5) + time::Duration::hours(hour);
            ForecastPoint::new("KORD", date!(2019 - 08 - 12), at)
                .with_value(fields::TEMPERATURE, Some(temp))
                .with_value(fields::WIND_SPEED, Some(10.0))
                .with_value(fields::PRECIP_PROBABILITY, Some(0.0))
        })
        .chain(std::iter::once(
            ForecastPoint::new("KORD", date!(2019 - 08 - 12), datetime!(2019-08-13 00:00 -5))
                .with_value(fields::TEMPERATURE, Some(76.0))
                .with_value(fields::WIND_SPEED, Some(10.0))
                .with_value(fields::PRECIP_PROBABILITY, Some(0.0)),
        ))
        .collect();
    RowBatch::Forecast {
        pull_date: date!(2019 - 08 - 12),
        points,
    }
}

fn batch_runner(store: Arc<dyn WeatherStore>) -> BatchRunner {
    let settings = FetchSettings {
        max_attempts: 1,
        retry_delay: DelayRange::none(),
        timeout: Duration::from_secs(5),
        user_agent: "nws-avf-test".into(),
    };
    let gate = Arc::new(PolitenessGate::new(DelayRange::none()));
    let fetcher = ResilientFetcher::new(logger(), settings, gate).unwrap();
    BatchRunner::new(logger(), Arc::new(fetcher), store, 2)
}

#[tokio::test]
async fn a_midnight_run_loads_scores_and_then_skips() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/MapClick.php"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DWML))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/obhistory/KORD.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(obhistory()))
        .expect(1)
        .mount(&server)
        .await;

    let site = kord(&server);
    let store: Arc<dyn WeatherStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    Ingestor::new(logger())
        .ingest(store.as_ref(), "KORD", previous_pull())
        .await
        .unwrap();

    // local midnight in Chicago
    let now: OffsetDateTime = datetime!(2019-08-13 05:00 UTC);
    let runner = batch_runner(store.clone());

    let report = runner.process_site(&site, now).await;
    assert_eq!(
        report.forecast,
        StepOutcome::Ingested(IngestOutcome::Loaded {
            table: Table::Forecast,
            rows: 2
        })
    );
    assert_eq!(
        report.actual,
        StepOutcome::Ingested(IngestOutcome::Loaded {
            table: Table::Actual,
            rows: 3
        })
    );
    // only yesterday's pull covers yesterday's actuals
    assert_eq!(
        report.comparison,
        StepOutcome::Ingested(IngestOutcome::Loaded {
            table: Table::Comparison,
            rows: 3
        })
    );
    assert!(!report.has_failure());

    let heatmap = AccuracyService::new(logger())
        .avf_heatmap(store.as_ref(), &site)
        .await
        .unwrap();
    assert_eq!(heatmap.len(), 3);
    assert_eq!(heatmap.cell(0, 21).unwrap().temp_delta, Some(1.0));
    assert_eq!(heatmap.cell(0, 21).unwrap().wind_speed_delta, Some(2.0));
    assert_eq!(heatmap.cell(0, 22).unwrap().temp_delta, Some(0.0));
    assert_eq!(heatmap.cell(0, 22).unwrap().wind_speed_delta, Some(10.0));
    assert_eq!(heatmap.cell(0, 23).unwrap().temp_delta, Some(-1.0));

    // a rerun fetches nothing and writes nothing
    let rerun = runner.process_site(&site, now).await;
    for step in [&rerun.forecast, &rerun.actual, &rerun.comparison] {
        assert!(matches!(
            step,
            StepOutcome::Ingested(IngestOutcome::AlreadyLoaded { .. })
        ));
    }
}

#[tokio::test]
async fn an_unreachable_feed_does_not_stop_the_other_steps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/MapClick.php"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/obhistory/KORD.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let site = kord(&server);
    let store: Arc<dyn WeatherStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let reports = batch_runner(store)
        .run(vec![site], datetime!(2019-08-13 05:00 UTC))
        .await;

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.forecast, StepOutcome::NotAvailable);
    assert!(matches!(report.actual, StepOutcome::ParseFailed(_)));
    assert!(matches!(report.comparison, StepOutcome::Skipped(_)));
    assert!(report.has_failure());
}

#[tokio::test]
async fn shutdown_abandons_a_batch_stuck_on_a_slow_feed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let site = kord(&server);
    let store: Arc<dyn WeatherStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let started = std::time::Instant::now();
    let reports = batch_runner(store.clone())
        .run_until(
            vec![site],
            datetime!(2019-08-13 05:00 UTC),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await;

    assert!(reports.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(store.forecast_points("KORD", None).await.unwrap().is_empty());
}
