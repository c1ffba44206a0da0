//! Map/reduce over named counters.
//!
//! A [`Mapper`] emits `(key, counters)` pairs per document, a [`Reducer`]
//! folds all counters emitted for one key. Reducers must be associative and
//! commutative: values are re-reduced in chunks and a key with a single
//! emitted value skips the reducer entirely.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::{compare_values, document_key, Document, ID_FIELD};
use super::MapReduceOutput;

/// Pending values per key before they are folded down.
const REREDUCE_THRESHOLD: usize = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Counters(BTreeMap<String, u64>);

impl Counters {
    pub fn new() -> Counters {
        Counters::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: u64) -> Counters {
        self.add(name, value);
        self
    }

    pub fn add(&mut self, name: impl Into<String>, value: u64) {
        *self.0.entry(name.into()).or_insert(0) += value;
    }

    pub fn merge(&mut self, other: &Counters) {
        for (name, value) in &other.0 {
            self.add(name.clone(), *value);
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Counter paths under `prefix`, ready for an upsert-increment.
    pub fn increments(&self, prefix: &str) -> Vec<(String, u64)> {
        self.iter()
            .map(|(name, value)| (format!("{prefix}.{name}"), value))
            .collect()
    }
}

/// One reduced key, stored as `{"_id": key, "value": counters}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduced {
    #[serde(rename = "_id")]
    pub id: Value,
    pub value: Counters,
}

impl Reduced {
    pub fn to_document(&self) -> Document {
        let mut document = Document::new();
        document.insert(ID_FIELD.to_owned(), self.id.clone());
        let value = self
            .value
            .iter()
            .map(|(name, count)| (name.to_owned(), Value::from(count)))
            .collect();
        document.insert("value".to_owned(), Value::Object(value));
        document
    }

    pub fn from_document(document: &Document) -> Result<Reduced, serde_json::Error> {
        serde_json::from_value(Value::Object(document.clone()))
    }
}

pub trait Mapper: Send + Sync {
    fn map(&self, document: &Document, emit: &mut dyn FnMut(Value, Counters));
}

pub trait Reducer: Send + Sync {
    fn reduce(&self, key: &Value, values: &[Counters]) -> Counters;
}

/// Adds up every counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumReducer;

impl Reducer for SumReducer {
    fn reduce(&self, _key: &Value, values: &[Counters]) -> Counters {
        values.iter().fold(Counters::new(), |mut total, counters| {
            total.merge(counters);
            total
        })
    }
}

struct Group {
    key: Value,
    values: Vec<Counters>,
}

pub(crate) struct Engine<'a> {
    mapper: &'a dyn Mapper,
    reducer: &'a dyn Reducer,
    groups: HashMap<String, Group>,
    input: u64,
    emitted: u64,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(mapper: &'a dyn Mapper, reducer: &'a dyn Reducer) -> Engine<'a> {
        Engine {
            mapper,
            reducer,
            groups: HashMap::new(),
            input: 0,
            emitted: 0,
        }
    }

    pub(crate) fn feed(&mut self, document: &Document) {
        self.input += 1;
        let reducer = self.reducer;
        let groups = &mut self.groups;
        let emitted = &mut self.emitted;
        self.mapper.map(document, &mut |key, counters| {
            *emitted += 1;
            let group = groups.entry(document_key(&key)).or_insert_with(|| Group {
                key,
                values: Vec::new(),
            });
            group.values.push(counters);
            if group.values.len() >= REREDUCE_THRESHOLD {
                let folded = reducer.reduce(&group.key, &group.values);
                group.values.clear();
                group.values.push(folded);
            }
        });
    }

    pub(crate) fn finish(self) -> MapReduceOutput {
        let reducer = self.reducer;
        let mut results: Vec<Reduced> = self
            .groups
            .into_values()
            .map(|mut group| {
                let value = if group.values.len() == 1 {
                    group.values.pop().unwrap_or_default()
                } else {
                    reducer.reduce(&group.key, &group.values)
                };
                Reduced {
                    id: group.key,
                    value,
                }
            })
            .collect();
        results.sort_by(|a, b| compare_values(&a.id, &b.id));

        MapReduceOutput {
            results,
            input: self.input,
            emitted: self.emitted,
            collection: None,
        }
    }
}
