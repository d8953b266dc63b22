//! Forecast accuracy engine
//!
//! Stores forecast snapshots and scraped actuals, interpolates every snapshot
//! onto the instants actuals were observed, and aggregates the deltas into
//! lead-time heatmaps.

pub mod db;
mod heatmap;
mod ingest;
mod interpolate;
mod models;
mod service;

pub use db::{
    reconcile, DateWindow, NaturalKey, Record, SqliteStore, StoreError, Table, Value,
    WeatherStore,
};
pub use heatmap::{
    build_avf, build_fvf, join_actuals, AvfCell, AvfHeatmap, DenseTable, FvfCell, FvfField,
    FvfHeatmap, FvfKey, HeatmapError,
};
pub use ingest::{IngestOutcome, Ingestor, RowBatch};
pub use interpolate::{interpolate, lead_day, reference_instant, InterpolationError, LinearInterpolant};
pub use models::{
    fields, format_date, format_timestamp, parse_date, parse_timestamp, ActualObservation,
    ComparisonRow, ForecastPoint, ForecastSnapshot, InterpolatedRow, SnapshotError, CLOCK_FORMAT,
    DATE_FORMAT,
};
pub use service::{AccuracyService, AggregationError, CompareOutcome};
