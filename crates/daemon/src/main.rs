use accuracy::{parse_date, AccuracyService, DenseTable, FvfField, HeatmapError, SqliteStore, WeatherStore};
use anyhow::{anyhow, Context};
use daemon::{
    get_config_info, setup_logger, sites_due, BatchRunner, Cli, Command, HeatmapField, HeatmapKind,
    OutputFormat, PolitenessGate, ResilientFetcher, SiteReport,
};
use nws_avf_core::{Site, SiteRegistry};
use slog::{debug, info, warn, Logger};
use std::{sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::time::interval;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = get_config_info()?;
    let logger = setup_logger(&cli);

    let sites_path = cli.sites_path();
    let registry = SiteRegistry::load(&sites_path)
        .with_context(|| format!("loading site registry {}", sites_path.display()))?;

    info!(logger, "NWS accuracy daemon starting...");
    info!(logger, "  Sites: {} from {}", registry.len(), sites_path.display());
    info!(logger, "  Database: {}", cli.db_path().display());

    let store: Arc<dyn WeatherStore> = Arc::new(SqliteStore::open(&cli.db_path(), &logger).await?);
    let gate = Arc::new(PolitenessGate::new(cli.politeness()?));
    let fetcher = Arc::new(ResilientFetcher::new(logger.clone(), cli.fetch_settings()?, gate)?);
    let runner = BatchRunner::new(logger.clone(), fetcher, store.clone(), cli.concurrency());

    match cli.command.clone().unwrap_or(Command::Run) {
        Command::Run => run_hourly(&cli, &logger, &runner, &registry).await,
        Command::Once { all, site } => {
            let now = OffsetDateTime::now_utc();
            let sites = select_sites(&registry, all, &site, now, cli.pull_hour())?;
            let reports = runner.run(sites, now).await;
            summarize(&logger, &reports);
        }
        Command::Compare { site, date } => {
            let site = lookup(&registry, &site)?;
            let date = parse_date(&date).with_context(|| format!("invalid date '{}'", date))?;
            let outcome = runner.compare(site, date).await;
            info!(logger, "comparison finished"; "site" => site.name(), "outcome" => ?outcome);
        }
        Command::Heatmap {
            site,
            kind,
            field,
            format,
        } => {
            let site = lookup(&registry, &site)?;
            let service = AccuracyService::new(logger.clone());
            let output = render_heatmap(&service, store.as_ref(), site, kind, field, format).await?;
            println!("{}", output);
        }
    }
    Ok(())
}

async fn run_hourly(cli: &Cli, logger: &Logger, runner: &BatchRunner, registry: &SiteRegistry) {
    let period = cli.run_interval().max(1);
    info!(logger, "Wait time between scheduler ticks: {} seconds", period);

    let mut ticker = interval(Duration::from_secs(period));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }

        let now = OffsetDateTime::now_utc();
        let due = sites_due(registry.sites(), now, cli.pull_hour());
        if due.is_empty() {
            debug!(logger, "no site at local hour {}", cli.pull_hour());
            continue;
        }
        match runner.run_until(due, now, &mut shutdown).await {
            Some(reports) => summarize(logger, &reports),
            None => break,
        }
    }
    info!(logger, "Received shutdown signal, stopping");
}

fn lookup<'a>(registry: &'a SiteRegistry, name: &str) -> Result<&'a Site, anyhow::Error> {
    registry
        .get(name)
        .ok_or_else(|| anyhow!("unknown site '{}'", name))
}

/// `--all` wins, then named sites, then whichever sites are due right now
fn select_sites(
    registry: &SiteRegistry,
    all: bool,
    names: &[String],
    now: OffsetDateTime,
    pull_hour: u8,
) -> Result<Vec<Site>, anyhow::Error> {
    if all {
        return Ok(registry.sites().to_vec());
    }
    if names.is_empty() {
        return Ok(sites_due(registry.sites(), now, pull_hour));
    }
    names
        .iter()
        .map(|name| lookup(registry, name).cloned())
        .collect()
}

fn summarize(logger: &Logger, reports: &[SiteReport]) {
    let incomplete = reports.iter().filter(|r| r.has_failure()).count();
    if incomplete > 0 {
        warn!(logger, "batch finished with incomplete sites"; "sites" => reports.len(), "incomplete" => incomplete);
    } else {
        info!(logger, "batch finished"; "sites" => reports.len());
    }
}

fn dense(table: DenseTable, format: OutputFormat) -> Result<String, HeatmapError> {
    match format {
        OutputFormat::Csv => table.to_csv(),
        OutputFormat::Json => table.to_json(),
    }
}

async fn render_heatmap(
    service: &AccuracyService,
    store: &dyn WeatherStore,
    site: &Site,
    kind: HeatmapKind,
    field: HeatmapField,
    format: OutputFormat,
) -> Result<String, anyhow::Error> {
    let output = match kind {
        HeatmapKind::Avf => {
            let heatmap = service.avf_heatmap(store, site).await?;
            match (field, format) {
                (HeatmapField::All, OutputFormat::Csv) => heatmap.to_csv()?,
                (HeatmapField::All, OutputFormat::Json) => heatmap.to_json()?,
                (HeatmapField::Temperature, _) => dense(heatmap.temperature_table(), format)?,
                (HeatmapField::WindSpeed, _) => dense(heatmap.wind_speed_table(), format)?,
                (HeatmapField::PrecipProbability, _) => {
                    return Err(anyhow!("the avf heatmap has no precipitation deltas"))
                }
            }
        }
        HeatmapKind::Fvf => {
            let heatmap = service.fvf_heatmap(store, site).await?;
            match (field, format) {
                (HeatmapField::All, OutputFormat::Csv) => heatmap.to_csv()?,
                (HeatmapField::All, OutputFormat::Json) => heatmap.to_json()?,
                (HeatmapField::Temperature, _) => dense(heatmap.dense(FvfField::Temperature), format)?,
                (HeatmapField::WindSpeed, _) => dense(heatmap.dense(FvfField::WindSpeed), format)?,
                (HeatmapField::PrecipProbability, _) => {
                    dense(heatmap.dense(FvfField::PrecipProbability), format)?
                }
            }
        }
    };
    Ok(output)
}
