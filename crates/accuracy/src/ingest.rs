//! Idempotent, existence-checked loading of parsed rows into the store

use std::{collections::HashMap, sync::Arc};

use slog::{debug, info, warn, Logger};
use time::Date;
use tokio::sync::Mutex;

use crate::db::{reconcile, DateWindow, NaturalKey, Record, StoreError, Table, WeatherStore};
use crate::models::{ActualObservation, ComparisonRow, ForecastPoint, ForecastSnapshot};

/// Rows of one load together with the identity that load is known by
#[derive(Debug, Clone)]
pub enum RowBatch {
    Forecast {
        pull_date: Date,
        points: Vec<ForecastPoint>,
    },
    Actual {
        date: Date,
        observations: Vec<ActualObservation>,
    },
    Comparison {
        date: Date,
        rows: Vec<ComparisonRow>,
    },
}

impl RowBatch {
    pub fn table(&self) -> Table {
        match self {
            RowBatch::Forecast { .. } => Table::Forecast,
            RowBatch::Actual { .. } => Table::Actual,
            RowBatch::Comparison { .. } => Table::Comparison,
        }
    }

    pub fn natural_key(&self, site: &str) -> NaturalKey {
        let site = site.to_string();
        match self {
            RowBatch::Forecast { pull_date, .. } => NaturalKey::ForecastPull {
                site,
                pull_date: *pull_date,
            },
            RowBatch::Actual { date, .. } => NaturalKey::ActualDates {
                site,
                window: DateWindow::day(*date),
            },
            RowBatch::Comparison { date, .. } => NaturalKey::ComparisonDates {
                site,
                window: DateWindow::day(*date),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RowBatch::Forecast { points, .. } => points.len(),
            RowBatch::Actual { observations, .. } => observations.len(),
            RowBatch::Comparison { rows, .. } => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A forecast batch has to form a valid snapshot: one site and pull date,
    /// no repeated instants.
    fn validate(&self, site: &str) -> Result<(), String> {
        match self {
            RowBatch::Forecast { pull_date, points } => {
                ForecastSnapshot::new(site, *pull_date, points.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            RowBatch::Actual { .. } | RowBatch::Comparison { .. } => Ok(()),
        }
    }

    fn records(&self) -> Result<Vec<Record>, StoreError> {
        match self {
            RowBatch::Forecast { points, .. } => points.iter().map(Record::try_from).collect(),
            RowBatch::Actual { observations, .. } => {
                observations.iter().map(Record::try_from).collect()
            }
            RowBatch::Comparison { rows, .. } => rows.iter().map(Record::try_from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Loaded { table: Table, rows: u64 },
    /// Rows for this key already exist; nothing was written
    AlreadyLoaded { table: Table, existing: u64 },
    /// The batch had no rows
    Empty { table: Table },
    /// The batch was malformed and nothing was written
    Rejected { table: Table, reason: String },
}

/// Serializes check-then-append per (table, site, key) within the process.
/// A key's lock is dropped from the map once no load holds it.
pub struct Ingestor {
    locks: Mutex<HashMap<NaturalKey, Arc<Mutex<()>>>>,
    logger: Logger,
}

impl Ingestor {
    pub fn new(logger: Logger) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            logger,
        }
    }

    async fn key_lock(&self, key: &NaturalKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    async fn release(&self, key: &NaturalKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks.get(key).is_some_and(|held| Arc::strong_count(held) == 1) {
            locks.remove(key);
        }
    }

    pub async fn ingest(
        &self,
        store: &dyn WeatherStore,
        site: &str,
        batch: RowBatch,
    ) -> Result<IngestOutcome, StoreError> {
        let table = batch.table();
        if batch.is_empty() {
            debug!(self.logger, "no rows to load"; "table" => table.name(), "site" => site);
            return Ok(IngestOutcome::Empty { table });
        }
        if let Err(reason) = batch.validate(site) {
            warn!(self.logger, "rejecting batch"; "table" => table.name(), "site" => site, "reason" => &reason);
            return Ok(IngestOutcome::Rejected { table, reason });
        }

        let key = batch.natural_key(site);
        let lock = self.key_lock(&key).await;
        let result = {
            let _guard = lock.lock().await;
            self.load(store, &key, batch).await
        };
        self.release(&key, lock).await;
        result
    }

    async fn load(
        &self,
        store: &dyn WeatherStore,
        key: &NaturalKey,
        batch: RowBatch,
    ) -> Result<IngestOutcome, StoreError> {
        let table = batch.table();
        let existing = store.count_matching(key).await?;
        if existing > 0 {
            info!(self.logger, "data already loaded, skipping"; "key" => key.to_string(), "existing_rows" => existing);
            return Ok(IngestOutcome::AlreadyLoaded { table, existing });
        }

        let mut rows = Vec::with_capacity(batch.len());
        for record in batch.records()? {
            let reconciled = reconcile(table, record);
            if !reconciled.dropped.is_empty() {
                warn!(self.logger, "dropping columns unknown to {}", table; "columns" => reconciled.dropped.join(","));
            }
            rows.push(reconciled.values);
        }

        let written = store.append(table, rows).await?;
        info!(self.logger, "loaded rows"; "key" => key.to_string(), "rows" => written);
        Ok(IngestOutcome::Loaded {
            table,
            rows: written,
        })
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }
}
