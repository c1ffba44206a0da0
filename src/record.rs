//! Typed crash records built from pipe-delimited input lines.
//!
//! A [`Header`] is parsed once from the first line of the input and shared by
//! every [`Record`] parsed against it, so a record always carries exactly the
//! header's fields, in header order.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::store::Document;

pub const DELIMITER: char = '|';

pub const EVENT_DATE: &str = "Event Date";
pub const MAKE: &str = "Make";
pub const TOTAL_FATAL_INJURIES: &str = "Total Fatal Injuries";

/// Input dates are always month/day/year.
pub const EVENT_DATE_FORMAT: &str = "%m/%d/%Y";

/// Column layout of the NTSB aviation accident export.
pub const AVIATION_FIELDS: [&str; 31] = [
    "Event Id",
    "Investigation Type",
    "Accident Number",
    "Event Date",
    "Location",
    "Country",
    "Latitude",
    "Longitude",
    "Airport Code",
    "Airport Name",
    "Injury Severity",
    "Aircraft Damage",
    "Aircraft Category",
    "Registration Number",
    "Make",
    "Model",
    "Amateur Built",
    "Number of Engines",
    "Engine Type",
    "FAR Description",
    "Schedule",
    "Purpose of Flight",
    "Air Carrier",
    "Total Fatal Injuries",
    "Total Serious Injuries",
    "Total Minor Injuries",
    "Total Uninjured",
    "Weather Condition",
    "Broad Phase of Flight",
    "Report Status",
    "Publication Date",
];

#[derive(Debug, thiserror::Error)]
#[error("invalid event date {value:?} (expected mm/dd/yyyy): {source}")]
pub struct DateParseError {
    pub value: String,
    #[source]
    pub source: chrono::ParseError,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("header has no `{0}` column")]
    MissingColumn(String),

    #[error("header column {0} has no name")]
    EmptyColumn(usize),

    #[error("header names `{0}` more than once")]
    DuplicateColumn(String),

    #[error(transparent)]
    Date(#[from] DateParseError),
}

pub fn parse_event_date(value: &str) -> Result<NaiveDate, DateParseError> {
    NaiveDate::parse_from_str(value.trim(), EVENT_DATE_FORMAT).map_err(|source| DateParseError {
        value: value.to_owned(),
        source,
    })
}

/// Parses a non-negative counter field. Blank or unparsable text counts as 0.
pub fn parse_count(value: &str) -> u64 {
    value.trim().parse().unwrap_or(0)
}

fn split_line(line: &str) -> impl Iterator<Item = &str> {
    line.trim_end_matches(['\r', '\n'])
        .split(DELIMITER)
        .map(str::trim)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    names: Vec<String>,
    event_date: usize,
}

impl Header {
    pub fn parse(line: &str) -> Result<Header, ParseError> {
        Header::from_fields(split_line(line))
    }

    pub fn from_fields<I, S>(fields: I) -> Result<Header, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = fields
            .into_iter()
            .map(|name| name.as_ref().trim().to_owned())
            .collect();
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(ParseError::EmptyColumn(i + 1));
            }
            if names[..i].contains(name) {
                return Err(ParseError::DuplicateColumn(name.clone()));
            }
        }
        let event_date = names
            .iter()
            .position(|name| name == EVENT_DATE)
            .ok_or_else(|| ParseError::MissingColumn(EVENT_DATE.to_owned()))?;
        Ok(Header { names, event_date })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::Date(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Text(text) => Value::String(text.clone()),
            FieldValue::Date(date) => Value::String(date.to_string()),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            FieldValue::Text(text) => serializer.serialize_str(text),
            FieldValue::Date(date) => date.serialize(serializer),
        }
    }
}

/// One crash report. Every value is text except `Event Date`.
#[derive(Debug, Clone)]
pub struct Record {
    header: Arc<Header>,
    values: Vec<FieldValue>,
    event_date: NaiveDate,
}

impl Record {
    pub fn parse(header: &Arc<Header>, line: &str) -> Result<Record, ParseError> {
        Record::from_fields(header, split_line(line))
    }

    pub fn from_fields<'a, I>(header: &Arc<Header>, fields: I) -> Result<Record, ParseError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let raw: Vec<&str> = fields.into_iter().collect();
        if raw.len() != header.len() {
            return Err(ParseError::FieldCount {
                expected: header.len(),
                found: raw.len(),
            });
        }

        let event_date = parse_event_date(raw[header.event_date])?;
        let values = raw
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                if idx == header.event_date {
                    FieldValue::Date(event_date)
                } else {
                    FieldValue::Text(value.trim().to_owned())
                }
            })
            .collect();

        Ok(Record {
            header: Arc::clone(header),
            values,
            event_date,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.header.position(name).map(|idx| &self.values[idx])
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn event_date(&self) -> NaiveDate {
        self.event_date
    }

    pub fn fatalities(&self) -> u64 {
        self.text(TOTAL_FATAL_INJURIES).map(parse_count).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.header
            .names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn to_document(&self) -> Document {
        self.iter()
            .map(|(name, value)| (name.to_owned(), value.to_json()))
            .collect()
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Arc<Header> {
        Arc::new(Header::parse("Event Id|Event Date|Make|Total Fatal Injuries\n").unwrap())
    }

    #[test]
    fn parses_line_against_header() {
        let record = Record::parse(&header(), "1|01/02/1994|CESSNA|2\n").unwrap();
        assert_eq!(record.len(), 4);
        assert_eq!(record.text("Make"), Some("CESSNA"));
        assert_eq!(
            record.event_date(),
            NaiveDate::from_ymd_opt(1994, 1, 2).unwrap()
        );
        assert_eq!(record.fatalities(), 2);
    }

    #[test]
    fn trims_padding_around_delimiters() {
        let header = Arc::new(
            Header::parse(" Event Id | Event Date | Make | Total Fatal Injuries \r\n").unwrap(),
        );
        let record = Record::parse(&header, " 20001218X45444 | 12/31/2001 | PIPER |  \r\n").unwrap();
        assert_eq!(record.text("Event Id"), Some("20001218X45444"));
        assert_eq!(record.text("Make"), Some("PIPER"));
        assert_eq!(record.fatalities(), 0);
    }

    #[test]
    fn rejects_field_count_mismatch() {
        let err = Record::parse(&header(), "1|01/02/1994|CESSNA").unwrap_err();
        assert!(matches!(
            err,
            ParseError::FieldCount {
                expected: 4,
                found: 3
            }
        ));

        let err = Record::parse(&header(), "1|01/02/1994|CESSNA|0|extra").unwrap_err();
        assert!(matches!(err, ParseError::FieldCount { found: 5, .. }));
    }

    #[test]
    fn rejects_malformed_dates() {
        for bad in ["", "1994-01-02", "13/01/1994", "02/30/1994", "yesterday"] {
            let line = format!("1|{bad}|CESSNA|0");
            let err = Record::parse(&header(), &line).unwrap_err();
            assert!(matches!(err, ParseError::Date(_)), "accepted {bad:?}");
        }
    }

    #[test]
    fn dates_are_month_first() {
        let date = parse_event_date("04/29/2011").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2011, 4, 29).unwrap());
        assert!(parse_event_date("29/04/2011").is_err());
    }

    #[test]
    fn header_requires_event_date() {
        let err = Header::parse("Event Id|Make").unwrap_err();
        assert!(matches!(err, ParseError::MissingColumn(column) if column == EVENT_DATE));
    }

    #[test]
    fn header_rejects_blank_and_repeated_names() {
        let err = Header::parse("Event Id|Event Date|Make|Make").unwrap_err();
        assert!(matches!(err, ParseError::DuplicateColumn(column) if column == MAKE));

        let err = Header::parse("Event Id|Event Date||Make").unwrap_err();
        assert!(matches!(err, ParseError::EmptyColumn(3)));

        let err = Header::parse("Event Id|Event Date|Make|").unwrap_err();
        assert!(matches!(err, ParseError::EmptyColumn(4)));
    }

    #[test]
    fn unparsable_fatalities_count_as_zero() {
        assert_eq!(parse_count(""), 0);
        assert_eq!(parse_count("  "), 0);
        assert_eq!(parse_count("n/a"), 0);
        assert_eq!(parse_count("-3"), 0);
        assert_eq!(parse_count(" 7 "), 7);
    }

    #[test]
    fn serializes_in_header_order_with_iso_date() {
        let record = Record::parse(&header(), "1|01/02/1994|CESSNA|").unwrap();
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"Event Id":"1","Event Date":"1994-01-02","Make":"CESSNA","Total Fatal Injuries":""}"#
        );
        assert_eq!(Value::Object(record.to_document()), serde_json::to_value(&record).unwrap());
    }

    #[test]
    fn full_aviation_header_parses() {
        let header = Header::from_fields(AVIATION_FIELDS).unwrap();
        assert_eq!(header.len(), AVIATION_FIELDS.len());
        assert_eq!(header.position(MAKE), Some(14));
    }
}
