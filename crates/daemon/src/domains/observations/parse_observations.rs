use accuracy::{ActualObservation, CLOCK_FORMAT};
use nws_avf_core::{localize_fixed, to_site_time, Site};
use scraper::{ElementRef, Html, Selector};
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time};
use time_tz::Tz;

/// Cells in a data row of the observation history table
pub const OBSERVATION_CELLS: usize = 18;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("observation table has no time header stating the zone")]
    MissingTimeHeader,
    #[error("observation table has no data rows")]
    NoRows,
    #[error("newest row is for day {found}, expected day {expected}")]
    AnchorMismatch { expected: u8, found: u8 },
    #[error("invalid day of month '{0}'")]
    InvalidDay(String),
    #[error("invalid clock time '{0}'")]
    InvalidTime(String),
    #[error("day {day} does not exist in {year}-{month}")]
    InvalidDate { year: i32, month: u8, day: u8 },
    #[error("invalid {column} value '{value}'")]
    InvalidNumber { column: &'static str, value: String },
    #[error("invalid wind '{0}'")]
    InvalidWind(String),
}

/// The scraped table before any typing
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationPage {
    /// Zone label from the time header, e.g. `cdt`
    pub zone_label: String,
    pub is_dst: bool,
    /// Newest first, `OBSERVATION_CELLS` cells each
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Wind {
    pub raw: Option<String>,
    pub direction: Option<String>,
    pub speed: Option<f64>,
    pub gust: Option<f64>,
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(e.to_string()))
}

fn cell_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pull the zone header and the fixed-width data rows out of the page
pub fn scrape_page(html: &str) -> Result<ObservationPage, ParseError> {
    let document = Html::parse_document(html);
    let th = selector("th")?;
    let tr = selector("tr")?;
    let td = selector("td")?;

    let zone_label = document
        .select(&th)
        .map(cell_text)
        .find(|text| text.contains("Time"))
        .and_then(|header| {
            let start = header.find('(')?;
            let end = header[start..].find(')')? + start;
            Some(header[start + 1..end].trim().to_string())
        })
        .filter(|label| !label.is_empty())
        .ok_or(ParseError::MissingTimeHeader)?;

    let rows: Vec<Vec<String>> = document
        .select(&tr)
        .map(|row| row.select(&td).map(cell_text).collect::<Vec<_>>())
        .filter(|cells| cells.len() == OBSERVATION_CELLS)
        .collect();
    if rows.is_empty() {
        return Err(ParseError::NoRows);
    }

    Ok(ObservationPage {
        is_dst: zone_label.to_uppercase().contains("DT"),
        zone_label,
        rows,
    })
}

fn is_placeholder(raw: &str) -> bool {
    let raw = raw.trim();
    raw.is_empty() || raw.eq_ignore_ascii_case("NA")
}

fn number(column: &'static str, raw: &str) -> Result<Option<f64>, ParseError> {
    if is_placeholder(raw) {
        return Ok(None);
    }
    raw.trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|_| ParseError::InvalidNumber {
            column,
            value: raw.to_string(),
        })
}

fn text(raw: &str) -> Option<String> {
    (!is_placeholder(raw)).then(|| raw.trim().to_string())
}

/// `Calm`, or `DIRECTION SPEED [G GUST]`
pub fn parse_wind(raw: &str) -> Result<Wind, ParseError> {
    if is_placeholder(raw) {
        return Ok(Wind {
            raw: None,
            direction: None,
            speed: None,
            gust: None,
        });
    }
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("calm") {
        return Ok(Wind {
            raw: Some(raw.to_string()),
            direction: None,
            speed: Some(0.0),
            gust: None,
        });
    }

    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let token = |i: usize| -> Result<Option<f64>, ParseError> {
        tokens
            .get(i)
            .map(|t| t.parse::<f64>().map_err(|_| ParseError::InvalidWind(raw.to_string())))
            .transpose()
    };
    let gust = if raw.contains('G') { token(3)? } else { None };
    Ok(Wind {
        raw: Some(raw.to_string()),
        direction: tokens.first().map(|t| t.to_string()),
        speed: token(1)?,
        gust,
    })
}

/// Full dates for the newest-first day-of-month column, walking back from
/// `anchor` and stepping back a month whenever the day number grows.
pub fn reconstruct_dates(days: &[u8], anchor: Date) -> Result<Vec<Date>, ParseError> {
    let Some(&newest) = days.first() else {
        return Err(ParseError::NoRows);
    };
    if newest != anchor.day() {
        return Err(ParseError::AnchorMismatch {
            expected: anchor.day(),
            found: newest,
        });
    }

    let mut year = anchor.year();
    let mut month = anchor.month();
    let mut running = anchor.day();
    days.iter()
        .map(|&day| {
            if day > running {
                month = month.previous();
                if month == Month::December {
                    year -= 1;
                }
            }
            running = day;
            Date::from_calendar_date(year, month, day).map_err(|_| ParseError::InvalidDate {
                year,
                month: month as u8,
                day,
            })
        })
        .collect()
}

fn observation(site: &Site, observed_at: OffsetDateTime, cells: &[String]) -> Result<ActualObservation, ParseError> {
    let wind = parse_wind(&cells[2])?;
    Ok(ActualObservation {
        wind_raw: wind.raw,
        wind_dir: wind.direction,
        wind_speed: wind.speed,
        gust_speed: wind.gust,
        visibility: number("visibility", &cells[3])?,
        weather: text(&cells[4]),
        sky_conditions: text(&cells[5]),
        air_temp: number("air_temp", &cells[6])?,
        dew_point: number("dew_point", &cells[7])?,
        temp_6_hour_max: number("temp_6_hour_max", &cells[8])?,
        temp_6_hour_min: number("temp_6_hour_min", &cells[9])?,
        relative_humidity: number("relative_humidity", &cells[10].replace('%', ""))?,
        wind_chill: number("wind_chill", &cells[11])?,
        heat_index: number("heat_index", &cells[12])?,
        pressure: number("pressure", &cells[13])?,
        pressure_mb: number("pressure_mb", &cells[14])?,
        precip_1_hour: number("precip_1_hour", &cells[15])?,
        precip_3_hour: number("precip_3_hour", &cells[16])?,
        precip_6_hour: number("precip_6_hour", &cells[17])?,
        ..ActualObservation::new(site.name(), observed_at)
    })
}

/// Type the scraped rows and resolve each one to an instant in the site zone.
///
/// Clock times are localized against the page's DST or standard substitute
/// offset, so a repeated fall-back hour keeps the instant the page meant.
/// When `retain` is set only rows whose local date matches it are returned.
pub fn resolve_observations(
    page: &ObservationPage,
    site: &Site,
    anchor: Date,
    retain: Option<Date>,
) -> Result<Vec<ActualObservation>, ParseError> {
    let days = page
        .rows
        .iter()
        .map(|cells| {
            cells[0]
                .trim()
                .parse::<u8>()
                .map_err(|_| ParseError::InvalidDay(cells[0].clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let dates = reconstruct_dates(&days, anchor)?;
    let fixed = site.offsets.for_period(page.is_dst);

    let mut observations = Vec::with_capacity(page.rows.len());
    for (cells, date) in page.rows.iter().zip(dates) {
        let clock = Time::parse(cells[1].trim(), CLOCK_FORMAT)
            .map_err(|_| ParseError::InvalidTime(cells[1].clone()))?;
        let observed_at = localize_fixed(PrimitiveDateTime::new(date, clock), fixed, site.tz);
        if retain.is_some_and(|day| observed_at.date() != day) {
            continue;
        }
        observations.push(observation(site, observed_at, cells)?);
    }
    observations.sort_by_key(|o| o.observed_at);
    Ok(observations)
}

pub fn parse_observations(
    html: &str,
    site: &Site,
    anchor: Date,
    retain: Option<Date>,
) -> Result<Vec<ActualObservation>, ParseError> {
    let page = scrape_page(html)?;
    resolve_observations(&page, site, anchor, retain)
}

/// The local date whose observations are complete: today in the site zone,
/// or yesterday before local noon.
pub fn last_actual_date(now: OffsetDateTime, tz: &Tz) -> Date {
    let local = to_site_time(now, tz);
    if local.hour() < 12 {
        (local - Duration::hours(12)).date()
    } else {
        local.date()
    }
}
