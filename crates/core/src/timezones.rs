//! Timezone resolution for scraped wall-clock times
//!
//! Observation pages publish local clock times plus a daylight/standard flag
//! in the table header, but no UTC offset. Each logical site timezone is
//! mapped to two fixed-offset substitutes so the wall-clock value can be
//! localized without touching the repeated or skipped hour of a transition.

use std::collections::HashMap;

use serde::Deserialize;
use time::{
    macros::{format_description, offset},
    Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset,
};
use time_tz::{timezones, OffsetDateTimeExt, OffsetResult, PrimitiveDateTimeExt, Tz};

use crate::ConfigError;

/// The two constant offsets standing in for a DST-observing zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubstituteOffsets {
    pub dst: UtcOffset,
    pub standard: UtcOffset,
}

impl SubstituteOffsets {
    pub fn for_period(&self, is_dst: bool) -> UtcOffset {
        if is_dst {
            self.dst
        } else {
            self.standard
        }
    }
}

/// Raw `[timezones."<zone>"]` entry of the site registry file
#[derive(Debug, Clone, Deserialize)]
pub struct SubstituteConfig {
    pub dst: String,
    pub standard: String,
}

#[derive(Debug, Clone)]
pub struct TimezoneTable {
    entries: HashMap<String, SubstituteOffsets>,
}

impl Default for TimezoneTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TimezoneTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// US zones served by the NWS observation history pages.
    /// Hawaii does not observe DST so both periods share one offset.
    pub fn builtin() -> Self {
        let zones: [(&[&str], UtcOffset, UtcOffset); 6] = [
            (&["US/Eastern", "America/New_York"], offset!(-4), offset!(-5)),
            (&["US/Central", "America/Chicago"], offset!(-5), offset!(-6)),
            (&["US/Mountain", "America/Denver"], offset!(-6), offset!(-7)),
            (
                &["US/Pacific", "America/Los_Angeles"],
                offset!(-7),
                offset!(-8),
            ),
            (&["US/Alaska", "America/Anchorage"], offset!(-8), offset!(-9)),
            (&["US/Hawaii", "Pacific/Honolulu"], offset!(-10), offset!(-10)),
        ];

        let mut table = Self::empty();
        for (names, dst, standard) in zones {
            for name in names {
                table.insert(name, SubstituteOffsets { dst, standard });
            }
        }
        table
    }

    /// Built-in zones overlaid with the configured entries
    pub fn with_overrides(overrides: &HashMap<String, SubstituteConfig>) -> Result<Self, ConfigError> {
        let mut table = Self::builtin();
        for (zone, raw) in overrides {
            table.insert(
                zone,
                SubstituteOffsets {
                    dst: parse_offset(&raw.dst)?,
                    standard: parse_offset(&raw.standard)?,
                },
            );
        }
        Ok(table)
    }

    pub fn insert(&mut self, zone: &str, offsets: SubstituteOffsets) {
        self.entries.insert(zone.to_string(), offsets);
    }

    pub fn substitutes(&self, zone: &str) -> Result<SubstituteOffsets, ConfigError> {
        self.entries
            .get(zone)
            .copied()
            .ok_or_else(|| ConfigError::MissingSubstitute(zone.to_string()))
    }

    pub fn contains(&self, zone: &str) -> bool {
        self.entries.contains_key(zone)
    }
}

/// Parse offsets written as `-05:00` / `+09:30`
pub fn parse_offset(value: &str) -> Result<UtcOffset, ConfigError> {
    UtcOffset::parse(
        value.trim(),
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .map_err(|e| ConfigError::InvalidOffset {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

pub fn lookup_timezone(name: &str) -> Result<&'static Tz, ConfigError> {
    timezones::get_by_name(name).ok_or_else(|| ConfigError::UnknownTimezone(name.to_string()))
}

/// Localize a naive wall-clock value against a fixed offset, then express the
/// resulting instant in the site's own timezone.
pub fn localize_fixed(naive: PrimitiveDateTime, fixed: UtcOffset, site_tz: &Tz) -> OffsetDateTime {
    naive.assume_offset(fixed).to_timezone(site_tz)
}

/// Midnight at the start of `date` in `tz`.
///
/// Returns `None` only for zones that skip midnight itself on a transition day.
/// When midnight repeats, the earlier instant wins.
pub fn local_midnight(date: Date, tz: &Tz) -> Option<OffsetDateTime> {
    match PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_timezone(tz) {
        OffsetResult::Some(dt) => Some(dt),
        OffsetResult::Ambiguous(first, _) => Some(first),
        OffsetResult::None => None,
    }
}

pub fn to_site_time(instant: OffsetDateTime, tz: &Tz) -> OffsetDateTime {
    instant.to_timezone(tz)
}
