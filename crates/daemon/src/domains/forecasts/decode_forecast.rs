use std::collections::BTreeMap;

use accuracy::ForecastPoint;
use nws_avf_core::{to_site_time, Site};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use time::{format_description::well_known::Rfc3339, Date, OffsetDateTime};

/*
NWS digital DWML (FcstType=digitalDWML) layout, trimmed to what is read here:

<dwml>
  <data>
    <time-layout>
      <start-valid-time>2019-08-13T07:00:00-05:00</start-valid-time>
      ...
    </time-layout>
    <parameters>
      <temperature type="hourly"><value>72</value>...</temperature>
      <probability-of-precipitation type="floating"><value xsi:nil="true"/>...
    </parameters>
  </data>
</dwml>
*/

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed forecast xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("forecast service returned an error document: {0}")]
    Service(String),
    #[error("forecast document has no time layout")]
    MissingTimeLayout,
    #[error("invalid forecast timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        source: time::error::Parse,
    },
    #[error("invalid value '{value}' in series {series}")]
    InvalidValue { series: String, value: String },
    #[error("series {series} has {found} values for {expected} timestamps")]
    SeriesLength {
        series: String,
        expected: usize,
        found: usize,
    },
}

/// `probability-of-precipitation` + `floating` -> `probability_of_precipitation_floating`
pub fn column_name(tag: &str, kind: &str) -> String {
    format!("{tag} {kind}")
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

struct Series {
    column: String,
    depth: usize,
    values: Vec<Option<f64>>,
}

#[derive(Default)]
struct DwmlState {
    path: Vec<String>,
    text: String,
    error_document: bool,
    layouts_seen: usize,
    timestamps: Vec<String>,
    current: Option<Series>,
    value_is_nil: bool,
    series: Vec<Series>,
}

impl DwmlState {
    fn parent(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }

    fn open(&mut self, name: String, element: &BytesStart) {
        if self.path.is_empty() && name == "error" {
            self.error_document = true;
        }
        if !self.error_document {
            self.text.clear();
        }

        match name.as_str() {
            "time-layout" if self.parent() == Some("data") => self.layouts_seen += 1,
            "value" if self.is_series_value(self.path.len()) => {
                self.value_is_nil = attribute(element, b"nil").as_deref() == Some("true");
            }
            _ if self.parent() == Some("parameters") => {
                if let Some(kind) = attribute(element, b"type") {
                    self.current = Some(Series {
                        column: column_name(&name, &kind),
                        depth: self.path.len(),
                        values: Vec::new(),
                    });
                }
            }
            _ => {}
        }
        self.path.push(name);
    }

    fn close(&mut self) -> Result<(), DecodeError> {
        let Some(name) = self.path.pop() else {
            return Ok(());
        };
        let depth = self.path.len();

        if name == "start-valid-time"
            && self.layouts_seen == 1
            && self.parent() == Some("time-layout")
        {
            self.timestamps.push(self.text.trim().to_string());
        } else if name == "value" && self.is_series_value(depth) {
            let raw = self.text.trim();
            let value = if self.value_is_nil || raw.is_empty() {
                None
            } else {
                Some(raw.parse::<f64>().map_err(|_| DecodeError::InvalidValue {
                    series: self.current_column(),
                    value: raw.to_string(),
                })?)
            };
            if let Some(series) = self.current.as_mut() {
                series.values.push(value);
            }
            self.value_is_nil = false;
        } else if self.current.as_ref().is_some_and(|s| s.depth == depth) {
            if let Some(series) = self.current.take() {
                self.series.push(series);
            }
        }
        Ok(())
    }

    /// `<value>` directly under the series element being read
    fn is_series_value(&self, depth: usize) -> bool {
        self.current.as_ref().is_some_and(|s| s.depth + 1 == depth)
    }

    fn current_column(&self) -> String {
        self.current
            .as_ref()
            .map(|s| s.column.clone())
            .unwrap_or_default()
    }
}

fn local_name(element: &BytesStart) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

fn attribute(element: &BytesStart, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

/// Decode a digital DWML document into one point per forecast timestamp,
/// with timestamps expressed in the site's timezone.
pub fn decode_forecast(xml: &str, site: &Site, pull_date: Date) -> Result<Vec<ForecastPoint>, DecodeError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut state = DwmlState::default();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => state.open(local_name(e), e),
            Event::Empty(ref e) => {
                state.open(local_name(e), e);
                state.close()?;
            }
            Event::Text(e) => state.text.push_str(&e.unescape()?),
            Event::End(_) => state.close()?,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if state.error_document {
        return Err(DecodeError::Service(state.text.trim().to_string()));
    }
    if state.timestamps.is_empty() {
        return Err(DecodeError::MissingTimeLayout);
    }

    let timestamps = state
        .timestamps
        .iter()
        .map(|raw| {
            OffsetDateTime::parse(raw, &Rfc3339)
                .map(|ts| to_site_time(ts, site.tz))
                .map_err(|source| DecodeError::InvalidTimestamp {
                    value: raw.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for series in &state.series {
        if series.values.len() != timestamps.len() {
            return Err(DecodeError::SeriesLength {
                series: series.column.clone(),
                expected: timestamps.len(),
                found: series.values.len(),
            });
        }
    }

    let points = timestamps
        .into_iter()
        .enumerate()
        .map(|(i, forecast_time)| {
            let values: BTreeMap<String, Option<f64>> = state
                .series
                .iter()
                .map(|s| (s.column.clone(), s.values[i]))
                .collect();
            ForecastPoint {
                values,
                ..ForecastPoint::new(site.name(), pull_date, forecast_time)
            }
        })
        .collect();
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accuracy::fields;
    use nws_avf_core::{SiteProfile, TimezoneTable};
    use time::macros::{date, datetime};

    fn kord() -> Site {
        Site::resolve(
            SiteProfile {
                name: "KORD".into(),
                timezone: "America/Chicago".into(),
                forecast_url: "https://example.invalid/fcst".into(),
                actual_url_template: "https://example.invalid/{site}".into(),
                city: None,
                state: None,
            },
            &TimezoneTable::builtin(),
        )
        .unwrap()
    }

    const DWML: &str = r#"<?xml version="1.0"?>
<dwml version="1.0" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <head><product>digital</product></head>
  <data>
    <location><location-key>point1</location-key></location>
    <time-layout time-coordinate="local">
      <layout-key>k-p1h-n3-0</layout-key>
      <start-valid-time>2019-08-13T07:00:00-05:00</start-valid-time>
      <end-valid-time>2019-08-13T08:00:00-05:00</end-valid-time>
      <start-valid-time>2019-08-13T08:00:00-05:00</start-valid-time>
      <end-valid-time>2019-08-13T09:00:00-05:00</end-valid-time>
      <start-valid-time>2019-08-13T14:00:00Z</start-valid-time>
      <end-valid-time>2019-08-13T15:00:00Z</end-valid-time>
    </time-layout>
    <time-layout time-coordinate="local">
      <layout-key>k-p3h-n1-1</layout-key>
      <start-valid-time>2019-08-20T07:00:00-05:00</start-valid-time>
    </time-layout>
    <parameters applicable-location="point1">
      <temperature type="hourly" units="Fahrenheit" time-layout="k-p1h-n3-0">
        <name>Temperature</name>
        <value>72</value><value>74</value><value>75</value>
      </temperature>
      <probability-of-precipitation type="floating" units="percent" time-layout="k-p1h-n3-0">
        <value>10</value><value xsi:nil="true"/><value></value>
      </probability-of-precipitation>
      <wind-speed type="sustained" units="miles/hour" time-layout="k-p1h-n3-0">
        <value>8</value><value>9</value><value>11</value>
      </wind-speed>
      <weather time-layout="k-p1h-n3-0">
        <weather-conditions><value coverage="chance" weather-type="rain"/></weather-conditions>
      </weather>
    </parameters>
  </data>
</dwml>"#;

    #[test]
    fn column_names_follow_tag_and_type() {
        assert_eq!(
            column_name("probability-of-precipitation", "floating"),
            fields::PRECIP_PROBABILITY
        );
        assert_eq!(column_name("wind-speed", "sustained"), fields::WIND_SPEED);
        assert_eq!(column_name("cloud-amount", "total"), "cloud_amount_total");
    }

    #[test]
    fn decodes_first_layout_and_typed_series() {
        let points = decode_forecast(DWML, &kord(), date!(2019 - 08 - 13)).unwrap();
        assert_eq!(points.len(), 3);

        assert_eq!(points[0].forecast_time, datetime!(2019-08-13 07:00 -5));
        assert_eq!(points[0].site, "KORD");
        assert_eq!(points[0].pull_date, date!(2019 - 08 - 13));
        assert_eq!(points[0].value(fields::TEMPERATURE), Some(72.0));
        assert_eq!(points[0].value(fields::PRECIP_PROBABILITY), Some(10.0));

        // utc stamps are moved into the site's zone
        assert_eq!(points[2].forecast_time, datetime!(2019-08-13 09:00 -5));
        assert_eq!(points[2].forecast_time.offset().whole_hours(), -5);
        assert_eq!(points[2].value(fields::WIND_SPEED), Some(11.0));

        assert_eq!(points[1].value(fields::PRECIP_PROBABILITY), None);
        assert_eq!(points[2].value(fields::PRECIP_PROBABILITY), None);
        assert!(points[1].values.contains_key(fields::PRECIP_PROBABILITY));

        // untyped elements are not series
        assert_eq!(points[0].values.len(), 3);
    }

    #[test]
    fn error_documents_are_reported() {
        let xml = "<error><h2>ERROR</h2><pre>Point with latitude 91 not on grid</pre></error>";
        let err = decode_forecast(xml, &kord(), date!(2019 - 08 - 13)).unwrap_err();
        assert!(matches!(err, DecodeError::Service(msg) if msg.contains("not on grid")));
    }

    #[test]
    fn mismatched_series_are_rejected() {
        let xml = r#"<dwml><data>
            <time-layout><start-valid-time>2019-08-13T07:00:00-05:00</start-valid-time>
            <start-valid-time>2019-08-13T08:00:00-05:00</start-valid-time></time-layout>
            <parameters><temperature type="hourly"><value>72</value></temperature></parameters>
        </data></dwml>"#;
        let err = decode_forecast(xml, &kord(), date!(2019 - 08 - 13)).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::SeriesLength {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn documents_without_layout_fail() {
        let err = decode_forecast("<dwml><data/></dwml>", &kord(), date!(2019 - 08 - 13)).unwrap_err();
        assert!(matches!(err, DecodeError::MissingTimeLayout));

        let xml = r#"<dwml><data><time-layout><start-valid-time>soon</start-valid-time></time-layout></data></dwml>"#;
        let err = decode_forecast(xml, &kord(), date!(2019 - 08 - 13)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidTimestamp { .. }));
    }
}
