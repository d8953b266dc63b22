//! NWS forecast accuracy core library
//!
//! Shared pieces for the accuracy engine and the daemon:
//! - Configuration loading (XDG-compliant)
//! - Site registry
//! - Timezone resolution with fixed-offset substitutes

mod config;
mod sites;
mod timezones;

pub use config::{
    find_config_file, get_xdg_data_dir, load_config, read_toml, ConfigError, ConfigSource,
};
pub use sites::{Site, SiteProfile, SiteRegistry};
pub use timezones::{
    local_midnight, localize_fixed, lookup_timezone, parse_offset, to_site_time,
    SubstituteConfig, SubstituteOffsets, TimezoneTable,
};

/// Application name used for XDG paths
pub const APP_NAME: &str = "nws-avf";

/// Default run interval (1 hour)
pub const DEFAULT_RUN_INTERVAL: u64 = 3600;

/// Local hour at which a site's daily pull happens
pub const DEFAULT_PULL_HOUR: u8 = 0;
