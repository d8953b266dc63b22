//! Site registry: the observation sites to pull and where their data lives

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use time_tz::Tz;

use crate::{lookup_timezone, read_toml, ConfigError, SubstituteConfig, SubstituteOffsets, TimezoneTable};

/// Reference data for one observation site, owned by the registry file
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SiteProfile {
    /// ICAO designation, e.g. `KORD`
    pub name: String,
    /// IANA timezone name, e.g. `US/Central`
    pub timezone: String,
    pub forecast_url: String,
    /// `{site}` is replaced with the site name
    pub actual_url_template: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl SiteProfile {
    pub fn actual_url(&self) -> String {
        self.actual_url_template.replace("{site}", &self.name)
    }
}

/// A profile with its timezone resolved against the tz database and the
/// substitute table
#[derive(Debug, Clone)]
pub struct Site {
    pub profile: SiteProfile,
    pub tz: &'static Tz,
    pub offsets: SubstituteOffsets,
}

impl Site {
    pub fn resolve(profile: SiteProfile, table: &TimezoneTable) -> Result<Self, ConfigError> {
        let tz = lookup_timezone(&profile.timezone)?;
        let offsets = table.substitutes(&profile.timezone)?;
        Ok(Site {
            profile,
            tz,
            offsets,
        })
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "site")]
    sites: Vec<SiteProfile>,
    #[serde(default)]
    timezones: HashMap<String, SubstituteConfig>,
}

#[derive(Debug, Clone)]
pub struct SiteRegistry {
    sites: Vec<Site>,
}

impl SiteRegistry {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file: RegistryFile = read_toml(path)?;
        Self::build(file)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: RegistryFile =
            toml::from_str(content).map_err(|e| ConfigError::Registry(e.to_string()))?;
        Self::build(file)
    }

    fn build(file: RegistryFile) -> Result<Self, ConfigError> {
        if file.sites.is_empty() {
            return Err(ConfigError::Registry(String::from("no [[site]] entries")));
        }

        let table = TimezoneTable::with_overrides(&file.timezones)?;
        let mut seen = HashSet::new();
        if let Some(dup) = file.sites.iter().find(|p| !seen.insert(p.name.as_str())) {
            return Err(ConfigError::Registry(format!(
                "duplicate site '{}'",
                dup.name
            )));
        }

        let sites = file
            .sites
            .into_iter()
            .map(|profile| Site::resolve(profile, &table))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SiteRegistry { sites })
    }

    pub fn get(&self, name: &str) -> Option<&Site> {
        self.sites.iter().find(|site| site.profile.name == name)
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
