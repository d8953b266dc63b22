use std::{env, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use nws_avf_core::{
    find_config_file, get_xdg_data_dir, load_config, ConfigError, ConfigSource,
    DEFAULT_PULL_HOUR, DEFAULT_RUN_INTERVAL,
};
use slog::{o, Drain, Level, Logger};

use crate::{DelayRange, FetchSettings};

#[derive(Parser, Clone, Debug, serde::Deserialize, Default)]
#[command(
    author,
    version,
    about = "NWS forecast accuracy daemon - pulls forecasts and observations and scores them"
)]
pub struct Cli {
    /// Path to config file (TOML format)
    /// Searched in order: this flag, $NWS_AVF_CONFIG, ./daemon.toml,
    /// $XDG_CONFIG_HOME/nws-avf/daemon.toml, /etc/nws-avf/daemon.toml
    #[arg(short, long, global = true)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long, global = true, env = "NWS_AVF_LEVEL")]
    pub level: Option<String>,

    /// SQLite database file
    #[arg(long, global = true, env = "NWS_AVF_DB_PATH")]
    pub db_path: Option<String>,

    /// Site registry file (TOML)
    #[arg(long, global = true, env = "NWS_AVF_SITES")]
    pub sites: Option<String>,

    /// Attempts per request before giving up
    #[arg(long, global = true, env = "NWS_AVF_FETCH_ATTEMPTS")]
    pub fetch_attempts: Option<u32>,

    /// Lower bound of the sleep between failed attempts, in seconds
    #[arg(long, global = true, env = "NWS_AVF_RETRY_DELAY_MIN")]
    pub retry_delay_min: Option<f64>,

    /// Upper bound of the sleep between failed attempts, in seconds
    #[arg(long, global = true, env = "NWS_AVF_RETRY_DELAY_MAX")]
    pub retry_delay_max: Option<f64>,

    /// Lower bound of the spacing between requests to one host, in seconds
    #[arg(long, global = true, env = "NWS_AVF_POLITENESS_MIN")]
    pub politeness_min: Option<f64>,

    /// Upper bound of the spacing between requests to one host, in seconds
    #[arg(long, global = true, env = "NWS_AVF_POLITENESS_MAX")]
    pub politeness_max: Option<f64>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "NWS_AVF_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// HTTP User-Agent header for NWS requests
    #[arg(short, long, global = true, env = "NWS_AVF_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Sites processed in parallel
    #[arg(long, global = true, env = "NWS_AVF_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Seconds between scheduler ticks in `run`
    #[arg(long, global = true, env = "NWS_AVF_RUN_INTERVAL")]
    pub run_interval: Option<u64>,

    /// Local hour at which a site is pulled in `run`
    #[arg(long, global = true, env = "NWS_AVF_PULL_HOUR")]
    pub pull_hour: Option<u8>,

    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Hourly loop; pulls each site when its local clock reaches the pull hour
    Run,
    /// Process sites once and exit
    Once {
        /// Every registered site, regardless of local time
        #[arg(long)]
        all: bool,
        /// Only these sites
        #[arg(long)]
        site: Vec<String>,
    },
    /// Build comparison rows for one site and local date
    Compare {
        #[arg(long)]
        site: String,
        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
    },
    /// Print a heatmap for one site
    Heatmap {
        #[arg(long)]
        site: String,
        #[arg(long, value_enum, default_value_t = HeatmapKind::Avf)]
        kind: HeatmapKind,
        #[arg(long, value_enum, default_value_t = HeatmapField::Temperature)]
        field: HeatmapField,
        #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeatmapKind {
    Avf,
    Fvf,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeatmapField {
    Temperature,
    WindSpeed,
    PrecipProbability,
    /// Every field, one row per cell
    All,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl Cli {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| get_xdg_data_dir().join("weather.db"))
    }

    pub fn sites_path(&self) -> PathBuf {
        self.sites
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("sites.toml"))
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(4)
    }

    pub fn run_interval(&self) -> u64 {
        self.run_interval.unwrap_or(DEFAULT_RUN_INTERVAL)
    }

    pub fn pull_hour(&self) -> u8 {
        self.pull_hour.unwrap_or(DEFAULT_PULL_HOUR)
    }

    pub fn politeness(&self) -> Result<DelayRange, ConfigError> {
        Ok(DelayRange::new(
            seconds("politeness_min", self.politeness_min.unwrap_or(3.0))?,
            seconds("politeness_max", self.politeness_max.unwrap_or(4.0))?,
        ))
    }

    pub fn fetch_settings(&self) -> Result<FetchSettings, ConfigError> {
        Ok(FetchSettings {
            max_attempts: self.fetch_attempts.unwrap_or(5).max(1),
            retry_delay: DelayRange::new(
                seconds("retry_delay_min", self.retry_delay_min.unwrap_or(15.0))?,
                seconds("retry_delay_max", self.retry_delay_max.unwrap_or(20.0))?,
            ),
            timeout: Duration::from_secs(self.request_timeout.unwrap_or(30)),
            user_agent: self
                .user_agent
                .clone()
                .unwrap_or_else(|| format!("nws-avf-daemon/{}", env!("CARGO_PKG_VERSION"))),
        })
    }

    /// Reject settings that cannot be turned into durations
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.politeness()?;
        self.fetch_settings()?;
        Ok(())
    }

    /// `self` wins field by field; `file` fills the gaps
    pub fn merge(self, file: Cli) -> Cli {
        Cli {
            config: self.config,
            level: self.level.or(file.level),
            db_path: self.db_path.or(file.db_path),
            sites: self.sites.or(file.sites),
            fetch_attempts: self.fetch_attempts.or(file.fetch_attempts),
            retry_delay_min: self.retry_delay_min.or(file.retry_delay_min),
            retry_delay_max: self.retry_delay_max.or(file.retry_delay_max),
            politeness_min: self.politeness_min.or(file.politeness_min),
            politeness_max: self.politeness_max.or(file.politeness_max),
            request_timeout: self.request_timeout.or(file.request_timeout),
            user_agent: self.user_agent.or(file.user_agent),
            concurrency: self.concurrency.or(file.concurrency),
            run_interval: self.run_interval.or(file.run_interval),
            pull_hour: self.pull_hour.or(file.pull_hour),
            command: self.command,
        }
    }
}

/// Finite, non-negative seconds
fn seconds(setting: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if value < 0.0 {
        return Err(ConfigError::InvalidSetting {
            setting,
            value: value.to_string(),
        });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidSetting {
        setting,
        value: value.to_string(),
    })
}

/// Load configuration from CLI args, config file, and environment
pub fn get_config_info() -> Result<Cli, anyhow::Error> {
    let cli_args = Cli::parse();

    let source = if let Some(ref path) = cli_args.config {
        ConfigSource::Explicit(path.into())
    } else {
        find_config_file("NWS_AVF_CONFIG", "daemon.toml")
    };

    // env vars are already folded into cli_args by clap
    let file_config: Cli = load_config(&source)?;
    let cli = cli_args.merge(file_config);
    cli.validate()?;
    Ok(cli)
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "info" => Level::Info,
        "warn" => Level::Warning,
        "error" => Level::Error,
        _ => Level::Info,
    }
}

pub fn setup_logger(cli: &Cli) -> Logger {
    let log_level = match cli.level.as_ref() {
        Some(level) => parse_level(level),
        None => parse_level(&env::var("RUST_LOG").unwrap_or_default()),
    };

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(log_level).fuse();
    slog::Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_win_over_the_file() {
        let cli = Cli::parse_from(["daemon", "--concurrency", "8", "once", "--site", "KORD"]);
        let file: Cli = toml::from_str(
            r#"
            concurrency = 2
            pull_hour = 1
            retry_delay_min = 0.5
            retry_delay_max = 0.5
            "#,
        )
        .unwrap();

        let merged = cli.merge(file);
        assert_eq!(merged.concurrency(), 8);
        assert_eq!(merged.pull_hour(), 1);
        assert_eq!(
            merged.fetch_settings().unwrap().retry_delay.sample(),
            Duration::from_millis(500)
        );
        assert!(matches!(
            merged.command,
            Some(Command::Once { all: false, ref site }) if site == &["KORD".to_string()]
        ));
    }

    #[test]
    fn defaults_match_the_nws_etiquette() {
        let settings = Cli::default().fetch_settings().unwrap();
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        let delay = settings.retry_delay.sample();
        assert!(delay >= Duration::from_secs(15) && delay <= Duration::from_secs(20));
        assert_eq!(Cli::default().run_interval(), 3600);
        assert!(settings.user_agent.starts_with("nws-avf-daemon/"));
    }

    #[test]
    fn unusable_delays_fail_validation() {
        for bad in ["retry_delay_max = inf", "politeness_min = nan", "retry_delay_min = -2.0"] {
            let cli: Cli = toml::from_str(bad).unwrap();
            assert!(
                matches!(cli.validate(), Err(ConfigError::InvalidSetting { .. })),
                "{bad} should be rejected"
            );
        }
        assert!(Cli::default().validate().is_ok());
    }

    #[test]
    fn heatmap_options_parse() {
        let cli = Cli::parse_from([
            "daemon", "heatmap", "--site", "KORD", "--kind", "fvf", "--field", "precip-probability",
            "--format", "json",
        ]);
        assert!(matches!(
            cli.command,
            Some(Command::Heatmap {
                kind: HeatmapKind::Fvf,
                field: HeatmapField::PrecipProbability,
                format: OutputFormat::Json,
                ..
            })
        ));
    }
}
