//! Declarative map/reduce view definitions.
//!
//! Each `*.toml` file in the views directory defines one view named after the
//! file stem:
//!
//! ```toml
//! group_by = "year_month"          # or "year", "all", { field = "Make" }
//!
//! [[counter]]
//! name = "crashes"                 # counts 1 per record
//!
//! [[counter]]
//! name = "fatalities"
//! sum = "Total Fatal Injuries"     # adds the field, blank counts as 0
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use serde_json::Value;

use super::PeriodKey;
use crate::record::{parse_count, EVENT_DATE, MAKE, TOTAL_FATAL_INJURIES};
use crate::store::{get_path, Counters, Document, Mapper, ID_FIELD};

const STORED_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, thiserror::Error)]
pub enum ViewDefinitionError {
    #[error("failed to read view definitions from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse view definition {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid view `{name}`: {reason}")]
    Invalid { name: String, reason: String },
}

/// Calendar granularity of a period key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    YearMonth,
    Year,
    All,
}

impl Period {
    pub fn key(&self, date: NaiveDate) -> PeriodKey {
        match self {
            Period::YearMonth => PeriodKey::YearMonth {
                year: date.year(),
                month: date.month0(),
            },
            Period::Year => PeriodKey::Year { year: date.year() },
            Period::All => PeriodKey::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    YearMonth,
    Year,
    All,
    Field(String),
}

impl GroupBy {
    pub fn period(&self) -> Option<Period> {
        match self {
            GroupBy::YearMonth => Some(Period::YearMonth),
            GroupBy::Year => Some(Period::Year),
            GroupBy::All => Some(Period::All),
            GroupBy::Field(_) => None,
        }
    }

    /// The key a base record document rolls up into, if any.
    pub fn key(&self, document: &Document) -> Option<Value> {
        match (self, self.period()) {
            (GroupBy::Field(field), _) => {
                Some(get_path(document, field).cloned().unwrap_or(Value::Null))
            }
            (_, Some(period)) => match stored_event_date(document) {
                Some(date) => Some(period.key(date).to_value()),
                None => {
                    log::warn!(
                        "Skipping document {} without a valid `{EVENT_DATE}`",
                        document.get(ID_FIELD).unwrap_or(&Value::Null)
                    );
                    None
                }
            },
            (_, None) => None,
        }
    }
}

impl From<Period> for GroupBy {
    fn from(period: Period) -> Self {
        match period {
            Period::YearMonth => GroupBy::YearMonth,
            Period::Year => GroupBy::Year,
            Period::All => GroupBy::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterSpec {
    pub name: String,
    /// Field to add up. Without it each record counts 1.
    #[serde(default)]
    pub sum: Option<String>,
}

impl CounterSpec {
    pub fn count(name: &str) -> CounterSpec {
        CounterSpec {
            name: name.to_owned(),
            sum: None,
        }
    }

    pub fn sum(name: &str, field: &str) -> CounterSpec {
        CounterSpec {
            name: name.to_owned(),
            sum: Some(field.to_owned()),
        }
    }

    fn value(&self, document: &Document) -> u64 {
        let Some(field) = &self.sum else {
            return 1;
        };
        match get_path(document, field) {
            Some(Value::String(text)) => parse_count(text),
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewDefinition {
    #[serde(skip)]
    pub name: String,
    pub group_by: GroupBy,
    #[serde(rename = "counter")]
    pub counters: Vec<CounterSpec>,
}

impl ViewDefinition {
    /// Crashes and fatalities per calendar month.
    pub fn event_date() -> ViewDefinition {
        ViewDefinition {
            name: "event_date".to_owned(),
            group_by: GroupBy::YearMonth,
            counters: vec![
                CounterSpec::count("crashes"),
                CounterSpec::sum("fatalities", TOTAL_FATAL_INJURIES),
            ],
        }
    }

    /// Crashes per aircraft make.
    pub fn make() -> ViewDefinition {
        ViewDefinition {
            name: "make".to_owned(),
            group_by: GroupBy::Field(MAKE.to_owned()),
            counters: vec![CounterSpec::count("crashes")],
        }
    }

    pub fn regrouped(&self, group_by: GroupBy) -> ViewDefinition {
        ViewDefinition {
            group_by,
            ..self.clone()
        }
    }

    pub fn from_toml(name: &str, text: &str, path: &Path) -> Result<ViewDefinition, ViewDefinitionError> {
        let mut definition: ViewDefinition =
            toml::from_str(text).map_err(|source| ViewDefinitionError::Parse {
                path: path.to_owned(),
                source,
            })?;
        definition.name = name.to_owned();
        definition.validate()?;
        Ok(definition)
    }

    pub fn load(path: &Path) -> Result<ViewDefinition, ViewDefinitionError> {
        let text = fs::read_to_string(path).map_err(|source| ViewDefinitionError::Io {
            path: path.to_owned(),
            source,
        })?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        ViewDefinition::from_toml(name, &text, path)
    }

    /// Loads every `*.toml` definition in `dir`, ordered by file name. A
    /// missing directory yields no views.
    pub fn load_dir(dir: &Path) -> Result<Vec<ViewDefinition>, ViewDefinitionError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("View directory {} does not exist", dir.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ViewDefinitionError::Io {
                    path: dir.to_owned(),
                    source,
                })
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| ViewDefinitionError::Io {
                    path: dir.to_owned(),
                    source,
                })?
                .path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();
        paths.iter().map(|path| ViewDefinition::load(path)).collect()
    }

    pub fn validate(&self) -> Result<(), ViewDefinitionError> {
        let invalid = |reason: String| ViewDefinitionError::Invalid {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("view name is empty".to_owned()));
        }
        if self.counters.is_empty() {
            return Err(invalid("at least one counter is required".to_owned()));
        }
        let mut seen = HashSet::new();
        for counter in &self.counters {
            if counter.name.is_empty() || counter.name.contains('.') {
                return Err(invalid(format!("bad counter name {:?}", counter.name)));
            }
            if !seen.insert(counter.name.as_str()) {
                return Err(invalid(format!("duplicate counter {:?}", counter.name)));
            }
        }
        if let GroupBy::Field(field) = &self.group_by {
            if field.is_empty() {
                return Err(invalid("group_by field is empty".to_owned()));
            }
        }
        Ok(())
    }

    pub fn counters(&self, document: &Document) -> Counters {
        self.counters
            .iter()
            .fold(Counters::new(), |counters, spec| {
                counters.with(spec.name.clone(), spec.value(document))
            })
    }
}

impl Mapper for ViewDefinition {
    fn map(&self, document: &Document, emit: &mut dyn FnMut(Value, Counters)) {
        if let Some(key) = self.group_by.key(document) {
            emit(key, self.counters(document));
        }
    }
}

fn stored_event_date(document: &Document) -> Option<NaiveDate> {
    let text = get_path(document, EVENT_DATE)?.as_str()?;
    NaiveDate::parse_from_str(text, STORED_DATE_FORMAT).ok()
}
