use std::{future::Future, sync::Arc};

use accuracy::{
    AccuracyService, CompareOutcome, DateWindow, IngestOutcome, Ingestor, NaturalKey, RowBatch,
    WeatherStore,
};
use nws_avf_core::{to_site_time, Site};
use slog::{debug, error, info, o, warn, Logger};
use time::{Date, OffsetDateTime};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{decode_forecast, last_actual_date, parse_observations, Fetched, ResilientFetcher};

/// What happened to one table for one site in one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Ingested(IngestOutcome),
    NotAvailable,
    ParseFailed(String),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiteReport {
    pub site: String,
    pub forecast: StepOutcome,
    pub actual: StepOutcome,
    pub comparison: StepOutcome,
}

impl SiteReport {
    /// Soft skips do not count; missing data, parse and store failures do
    pub fn has_failure(&self) -> bool {
        [&self.forecast, &self.actual, &self.comparison].iter().any(|step| {
            matches!(
                step,
                StepOutcome::NotAvailable | StepOutcome::ParseFailed(_) | StepOutcome::Failed(_)
            )
        })
    }
}

/// Sites whose local clock reads `pull_hour` at `now`
pub fn sites_due(sites: &[Site], now: OffsetDateTime, pull_hour: u8) -> Vec<Site> {
    sites
        .iter()
        .filter(|site| to_site_time(now, site.tz).hour() == pull_hour)
        .cloned()
        .collect()
}

/// Runs the per-site pipeline: forecast pull, actual pull, then the
/// comparison job. Sites run in parallel up to the configured limit.
#[derive(Clone)]
pub struct BatchRunner {
    fetcher: Arc<ResilientFetcher>,
    store: Arc<dyn WeatherStore>,
    ingestor: Arc<Ingestor>,
    accuracy: Arc<AccuracyService>,
    permits: Arc<Semaphore>,
    logger: Logger,
}

impl BatchRunner {
    pub fn new(
        logger: Logger,
        fetcher: Arc<ResilientFetcher>,
        store: Arc<dyn WeatherStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            store,
            ingestor: Arc::new(Ingestor::new(logger.clone())),
            accuracy: Arc::new(AccuracyService::new(logger.clone())),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            logger,
        }
    }

    pub async fn run(&self, sites: Vec<Site>, now: OffsetDateTime) -> Vec<SiteReport> {
        info!(self.logger, "processing {} sites", sites.len());
        let mut set = JoinSet::new();
        for site in sites {
            let runner = self.clone();
            set.spawn(async move {
                let _permit = runner.permits.clone().acquire_owned().await;
                runner.process_site(&site, now).await
            });
        }

        let mut reports = Vec::new();
        while let Some(result) = set.join_next().await {
            match result {
                Ok(report) => {
                    info!(self.logger, "site finished";
                        "site" => &report.site,
                        "forecast" => ?report.forecast,
                        "actual" => ?report.actual,
                        "comparison" => ?report.comparison);
                    reports.push(report);
                }
                Err(e) => error!(self.logger, "site task failed: {}", e),
            }
        }
        reports.sort_by(|a, b| a.site.cmp(&b.site));
        reports
    }

    /// Like `run`, but gives up on the batch as soon as `shutdown` resolves.
    /// Dropping the join set aborts the site tasks still in flight.
    pub async fn run_until<F: Future>(
        &self,
        sites: Vec<Site>,
        now: OffsetDateTime,
        shutdown: F,
    ) -> Option<Vec<SiteReport>> {
        tokio::select! {
            reports = self.run(sites, now) => Some(reports),
            _ = shutdown => {
                warn!(self.logger, "shutdown requested, abandoning the current batch");
                None
            }
        }
    }

    /// Each step stands alone; a failed forecast pull does not stop the
    /// actual pull or the comparison.
    pub async fn process_site(&self, site: &Site, now: OffsetDateTime) -> SiteReport {
        let logger = self.logger.new(o!("site" => site.name().to_string()));
        let pull_date = to_site_time(now, site.tz).date();
        let anchor = last_actual_date(now, site.tz);
        debug!(logger, "pull date {}, last actual date {}", pull_date, anchor);

        let forecast = self.pull_forecast(site, pull_date, &logger).await;
        let actual = self.pull_actuals(site, anchor, &logger).await;
        let comparison = self.compare(site, anchor).await;

        SiteReport {
            site: site.name().to_string(),
            forecast,
            actual,
            comparison,
        }
    }

    async fn pull_forecast(&self, site: &Site, pull_date: Date, logger: &Logger) -> StepOutcome {
        let key = NaturalKey::ForecastPull {
            site: site.name().to_string(),
            pull_date,
        };
        if let Some(done) = self.already_loaded(&key, logger).await {
            return done;
        }

        let xml = match self.fetcher.fetch(&site.profile.forecast_url).await {
            Fetched::Body(xml) => xml,
            Fetched::NotAvailable => {
                warn!(logger, "forecast not available");
                return StepOutcome::NotAvailable;
            }
        };
        match decode_forecast(&xml, site, pull_date) {
            Ok(points) => {
                self.ingest(site, RowBatch::Forecast { pull_date, points }, logger)
                    .await
            }
            Err(e) => {
                warn!(logger, "could not decode forecast: {}", e);
                StepOutcome::ParseFailed(e.to_string())
            }
        }
    }

    async fn pull_actuals(&self, site: &Site, anchor: Date, logger: &Logger) -> StepOutcome {
        let key = NaturalKey::ActualDates {
            site: site.name().to_string(),
            window: DateWindow::day(anchor),
        };
        if let Some(done) = self.already_loaded(&key, logger).await {
            return done;
        }

        let html = match self.fetcher.fetch(&site.profile.actual_url()).await {
            Fetched::Body(html) => html,
            Fetched::NotAvailable => {
                warn!(logger, "observations not available");
                return StepOutcome::NotAvailable;
            }
        };
        match parse_observations(&html, site, anchor, Some(anchor)) {
            Ok(observations) => {
                let batch = RowBatch::Actual {
                    date: anchor,
                    observations,
                };
                self.ingest(site, batch, logger).await
            }
            Err(e) => {
                warn!(logger, "could not parse observations: {}", e);
                StepOutcome::ParseFailed(e.to_string())
            }
        }
    }

    /// Build and store the comparison rows for one local date
    pub async fn compare(&self, site: &Site, date: Date) -> StepOutcome {
        match self
            .accuracy
            .compare_date(self.store.as_ref(), &self.ingestor, site, date)
            .await
        {
            Ok(CompareOutcome::Ingested(outcome)) => StepOutcome::Ingested(outcome),
            Ok(CompareOutcome::Skipped { reason }) => StepOutcome::Skipped(reason),
            Err(e) => {
                error!(self.logger, "comparison failed"; "site" => site.name(), "error" => %e);
                StepOutcome::Failed(e.to_string())
            }
        }
    }

    async fn already_loaded(&self, key: &NaturalKey, logger: &Logger) -> Option<StepOutcome> {
        match self.store.count_matching(key).await {
            Ok(0) => None,
            Ok(existing) => {
                info!(logger, "{} already loaded, not fetching", key);
                Some(StepOutcome::Ingested(IngestOutcome::AlreadyLoaded {
                    table: key.table(),
                    existing,
                }))
            }
            Err(e) => {
                error!(logger, "could not check {}: {}", key, e);
                Some(StepOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn ingest(&self, site: &Site, batch: RowBatch, logger: &Logger) -> StepOutcome {
        match self.ingestor.ingest(self.store.as_ref(), site.name(), batch).await {
            Ok(IngestOutcome::Rejected { reason, .. }) => StepOutcome::ParseFailed(reason),
            Ok(outcome) => StepOutcome::Ingested(outcome),
            Err(e) => {
                error!(logger, "ingest failed: {}", e);
                StepOutcome::Failed(e.to_string())
            }
        }
    }
}
