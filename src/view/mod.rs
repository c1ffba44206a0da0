//! Aggregation views over the base collection.
//!
//! A view is materialized as one document per key, shaped like
//! `{"_id": {"year": 1994, "month": 0}, "value": {"crashes": 116, "fatalities": 60}}`
//! with zero-based months. It can be rebuilt from scratch with map/reduce or
//! kept current one record at a time.

pub mod definition;

pub use definition::{CounterSpec, GroupBy, Period, ViewDefinition, ViewDefinitionError};

use std::ops::{Bound, RangeInclusive};

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::record::Record;
use crate::store::{
    compare_values, get_path, Counters, Document, DocumentStore, Filter, FindOptions,
    MapReduceOptions, MapReduceOutput, Mapper, Reduced, StoreError, SumReducer, ID_FIELD,
};

const VALUE_FIELD: &str = "value";

/// Key of one aggregated period. `All` is stored as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeriodKey {
    YearMonth { year: i32, month: u32 },
    Year { year: i32 },
    All,
}

impl PeriodKey {
    pub fn to_value(&self) -> Value {
        match self {
            PeriodKey::YearMonth { year, month } => json!({ "year": year, "month": month }),
            PeriodKey::Year { year } => json!({ "year": year }),
            PeriodKey::All => Value::Null,
        }
    }

    pub fn from_value(value: &Value) -> Option<PeriodKey> {
        PeriodKey::deserialize(value).ok()
    }

    pub fn year(&self) -> Option<i32> {
        match self {
            PeriodKey::YearMonth { year, .. } | PeriodKey::Year { year } => Some(*year),
            PeriodKey::All => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregatedPeriod {
    pub key: PeriodKey,
    pub crashes: u64,
    pub fatalities: u64,
}

impl AggregatedPeriod {
    pub fn from_reduced(reduced: &Reduced) -> Option<AggregatedPeriod> {
        Some(AggregatedPeriod {
            key: PeriodKey::from_value(&reduced.id)?,
            crashes: reduced.value.get("crashes"),
            fatalities: reduced.value.get("fatalities"),
        })
    }
}

/// Re-keys materialized `{year, month}` documents into a coarser period.
struct RollupMapper {
    period: Period,
}

impl Mapper for RollupMapper {
    fn map(&self, document: &Document, emit: &mut dyn FnMut(Value, Counters)) {
        let Some(key) = document.get(ID_FIELD).and_then(PeriodKey::from_value) else {
            return;
        };
        let key = match (self.period, key) {
            (Period::All, _) => PeriodKey::All,
            (Period::Year, PeriodKey::YearMonth { year, .. } | PeriodKey::Year { year }) => {
                PeriodKey::Year { year }
            }
            (Period::YearMonth, key @ PeriodKey::YearMonth { .. }) => key,
            _ => return,
        };

        let mut counters = Counters::new();
        if let Some(Value::Object(values)) = get_path(document, VALUE_FIELD) {
            for (name, value) in values {
                counters.add(name.clone(), value.as_u64().unwrap_or(0));
            }
        }
        emit(key.to_value(), counters);
    }
}

/// Owns one view definition and keeps its materialized collection current.
#[derive(Debug, Clone)]
pub struct ViewMaintainer {
    definition: ViewDefinition,
    source: String,
    view: String,
}

impl ViewMaintainer {
    /// The view is materialized into a collection named after the definition.
    pub fn new(definition: ViewDefinition, source: impl Into<String>) -> ViewMaintainer {
        let view = definition.name.clone();
        ViewMaintainer {
            definition,
            source: source.into(),
            view,
        }
    }

    pub fn with_view_collection(mut self, view: impl Into<String>) -> ViewMaintainer {
        self.view = view.into();
        self
    }

    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    pub fn view_collection(&self) -> &str {
        &self.view
    }

    pub fn contributions_collection(&self) -> String {
        format!("{}.contributions", self.view)
    }

    /// Replaces the materialized view with a map/reduce over the whole
    /// source collection.
    pub async fn rebuild<S: DocumentStore>(&self, store: &S) -> Result<MapReduceOutput, StoreError> {
        log::info!("Creating view {} from {}", self.view, self.source);
        let options = MapReduceOptions::materialized(&self.view);
        let output = store
            .map_reduce(&self.source, &self.definition, &SumReducer, &options)
            .await?;
        log::debug!(
            "View {}: {} input(s), {} emit(s), {} key(s)",
            self.view,
            output.input,
            output.emitted,
            output.results.len()
        );
        Ok(output)
    }

    /// Inline map/reduce of the source collection with another grouping,
    /// restricted to documents matching `filter`.
    pub async fn aggregate<S: DocumentStore>(
        &self,
        store: &S,
        group_by: GroupBy,
        filter: Filter,
        limit: usize,
    ) -> Result<MapReduceOutput, StoreError> {
        let mapper = self.definition.regrouped(group_by);
        let options = MapReduceOptions::inline()
            .with_query(filter)
            .with_limit(limit);
        store
            .map_reduce(&self.source, &mapper, &SumReducer, &options)
            .await
    }

    /// Folds one new record into the view. Applying the same record twice
    /// counts it twice.
    pub async fn increment<S: DocumentStore>(&self, store: &S, record: &Record) -> Result<(), StoreError> {
        let document = record.to_document();
        let Some(key) = self.definition.group_by.key(&document) else {
            return Ok(());
        };
        let counters = self.definition.counters(&document);
        store
            .upsert_increment(&self.view, &key, &counters.increments(VALUE_FIELD))
            .await
    }

    /// Like [`ViewMaintainer::increment`] but skips records whose `source_id`
    /// was already folded in. Returns whether the record was applied.
    ///
    /// The id is claimed before the counters move, so a failure in between
    /// drops that record until the next rebuild.
    pub async fn increment_once<S: DocumentStore>(
        &self,
        store: &S,
        source_id: &str,
        record: &Record,
    ) -> Result<bool, StoreError> {
        let ledger = self.contributions_collection();
        let id = Value::String(source_id.to_owned());
        if !store.insert_if_absent(&ledger, &id, Document::new()).await? {
            log::debug!("Record {source_id} is already part of view {}", self.view);
            return Ok(false);
        }
        self.increment(store, record).await?;
        Ok(true)
    }

    /// Every materialized entry, ordered by key.
    pub async fn entries<S: DocumentStore>(&self, store: &S) -> Result<Vec<Reduced>, StoreError> {
        let options = FindOptions::new();
        let documents: Vec<Document> = store
            .find(&self.view, &Filter::All, &options)
            .try_collect()
            .await?;
        let mut entries = documents
            .iter()
            .map(Reduced::from_document)
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| compare_values(&a.id, &b.id));
        Ok(entries)
    }

    pub async fn periods<S: DocumentStore>(&self, store: &S) -> Result<Vec<AggregatedPeriod>, StoreError> {
        self.entries(store)
            .await?
            .iter()
            .map(|entry| {
                AggregatedPeriod::from_reduced(entry).ok_or_else(|| StoreError::Query {
                    collection: self.view.clone(),
                    reason: format!("view key {} is not a period", entry.id),
                })
            })
            .collect()
    }

    /// Rolls the materialized view up to `period`, optionally keeping only
    /// the months of the given years.
    pub async fn rollup<S: DocumentStore>(
        &self,
        store: &S,
        period: Period,
        years: Option<RangeInclusive<i32>>,
    ) -> Result<Vec<AggregatedPeriod>, StoreError> {
        let query = match years {
            Some(years) => Filter::range(
                format!("{ID_FIELD}.year"),
                Bound::Included(json!(years.start())),
                Bound::Included(json!(years.end())),
            ),
            None => Filter::All,
        };
        let options = MapReduceOptions::inline().with_query(query);
        let output = store
            .map_reduce(&self.view, &RollupMapper { period }, &SumReducer, &options)
            .await?;
        Ok(output
            .results
            .iter()
            .filter_map(AggregatedPeriod::from_reduced)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::record::{Header, EVENT_DATE, MAKE, TOTAL_FATAL_INJURIES};
    use crate::store::MemoryStore;

    const SOURCE: &str = "crashes";

    fn header() -> Arc<Header> {
        Arc::new(Header::from_fields(["Event Id", EVENT_DATE, MAKE, TOTAL_FATAL_INJURIES]).unwrap())
    }

    fn record(header: &Arc<Header>, id: &str, date: &str, make: &str, fatalities: &str) -> Record {
        Record::from_fields(header, [id, date, make, fatalities]).unwrap()
    }

    fn sample() -> Vec<Record> {
        let header = header();
        vec![
            record(&header, "1", "01/05/1994", "PIPER", "2"),
            record(&header, "2", "01/20/1994", "CESSNA", ""),
            record(&header, "3", "02/01/1994", "CESSNA", "1"),
            record(&header, "4", "12/31/1994", "BOEING", "0"),
            record(&header, "5", "03/15/1995", "PIPER", "4"),
            record(&header, "6", "03/16/1995", "PIPER", "x"),
        ]
    }

    async fn seeded(records: &[Record]) -> MemoryStore {
        let store = MemoryStore::new();
        store.bulk_insert(SOURCE, records).await.unwrap();
        store
    }

    fn maintainer() -> ViewMaintainer {
        ViewMaintainer::new(ViewDefinition::event_date(), SOURCE)
    }

    fn by_key(periods: Vec<AggregatedPeriod>) -> BTreeMap<String, (u64, u64)> {
        periods
            .into_iter()
            .map(|p| (p.key.to_value().to_string(), (p.crashes, p.fatalities)))
            .collect()
    }

    #[tokio::test]
    async fn rebuild_counts_crashes_and_fatalities_per_month() {
        let store = seeded(&sample()).await;
        let view = maintainer();
        view.rebuild(&store).await.unwrap();

        let periods = view.periods(&store).await.unwrap();
        assert_eq!(
            periods[0],
            AggregatedPeriod {
                key: PeriodKey::YearMonth { year: 1994, month: 0 },
                crashes: 2,
                fatalities: 2,
            }
        );
        let keys: Vec<PeriodKey> = periods.iter().map(|p| p.key).collect();
        assert_eq!(
            keys,
            vec![
                PeriodKey::YearMonth { year: 1994, month: 0 },
                PeriodKey::YearMonth { year: 1994, month: 1 },
                PeriodKey::YearMonth { year: 1994, month: 11 },
                PeriodKey::YearMonth { year: 1995, month: 2 },
            ]
        );
        let crashes: u64 = periods.iter().map(|p| p.crashes).sum();
        assert_eq!(crashes, sample().len() as u64);
    }

    #[tokio::test]
    async fn rebuild_is_byte_identical() {
        let store = seeded(&sample()).await;
        let view = maintainer();
        view.rebuild(&store).await.unwrap();
        let first = serde_json::to_string(&store.documents("event_date")).unwrap();
        view.rebuild(&store).await.unwrap();
        let second = serde_json::to_string(&store.documents("event_date")).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn months_add_up_to_years_and_total() {
        let store = seeded(&sample()).await;
        let view = maintainer();
        view.rebuild(&store).await.unwrap();

        let years = view.rollup(&store, Period::Year, None).await.unwrap();
        assert_eq!(
            years,
            vec![
                AggregatedPeriod { key: PeriodKey::Year { year: 1994 }, crashes: 4, fatalities: 3 },
                AggregatedPeriod { key: PeriodKey::Year { year: 1995 }, crashes: 2, fatalities: 4 },
            ]
        );

        let total = view.rollup(&store, Period::All, None).await.unwrap();
        assert_eq!(
            total,
            vec![AggregatedPeriod { key: PeriodKey::All, crashes: 6, fatalities: 7 }]
        );

        let limited = view.rollup(&store, Period::Year, Some(1995..=1996)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].key, PeriodKey::Year { year: 1995 });
    }

    #[tokio::test]
    async fn aggregate_matches_rollup() {
        let store = seeded(&sample()).await;
        let view = maintainer();
        view.rebuild(&store).await.unwrap();

        let inline = view
            .aggregate(&store, GroupBy::Year, Filter::All, 0)
            .await
            .unwrap();
        let inline: Vec<AggregatedPeriod> = inline
            .results
            .iter()
            .filter_map(AggregatedPeriod::from_reduced)
            .collect();
        assert_eq!(inline, view.rollup(&store, Period::Year, None).await.unwrap());

        let piper = view
            .aggregate(&store, GroupBy::All, Filter::eq(MAKE, "PIPER"), 0)
            .await
            .unwrap();
        assert_eq!(piper.input, 3);
        assert_eq!(piper.results[0].value.get("crashes"), 3);
        assert_eq!(piper.results[0].value.get("fatalities"), 6);
    }

    #[tokio::test]
    async fn incremental_converges_with_rebuild_in_any_order() {
        let records = sample();
        let store = seeded(&records).await;
        let rebuilt = maintainer();
        rebuilt.rebuild(&store).await.unwrap();
        let expected = by_key(rebuilt.periods(&store).await.unwrap());

        let reversed = maintainer().with_view_collection("reversed");
        for record in records.iter().rev() {
            reversed.increment(&store, record).await.unwrap();
        }
        assert_eq!(by_key(reversed.periods(&store).await.unwrap()), expected);

        let interleaved = maintainer().with_view_collection("interleaved");
        let (even, odd): (Vec<_>, Vec<_>) = records.iter().enumerate().partition(|(i, _)| i % 2 == 0);
        for (_, record) in odd.into_iter().chain(even) {
            interleaved.increment(&store, record).await.unwrap();
        }
        assert_eq!(by_key(interleaved.periods(&store).await.unwrap()), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_sum() {
        let store = Arc::new(MemoryStore::new());
        let header = header();
        let mut tasks = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            let crash = record(&header, &i.to_string(), "07/04/1999", "CESSNA", "1");
            tasks.push(tokio::spawn(async move {
                maintainer().increment(store.as_ref(), &crash).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let periods = maintainer().periods(store.as_ref()).await.unwrap();
        assert_eq!(
            periods,
            vec![AggregatedPeriod {
                key: PeriodKey::YearMonth { year: 1999, month: 6 },
                crashes: 50,
                fatalities: 50,
            }]
        );
    }

    #[tokio::test]
    async fn increment_once_ignores_duplicates() {
        let store = MemoryStore::new();
        let view = maintainer();
        let header = header();
        let first = record(&header, "1", "01/05/1994", "PIPER", "2");

        assert!(view.increment_once(&store, "a", &first).await.unwrap());
        assert!(!view.increment_once(&store, "a", &first).await.unwrap());
        assert!(view.increment_once(&store, "b", &first).await.unwrap());

        let periods = view.periods(&store).await.unwrap();
        assert_eq!(periods[0].crashes, 2);
        assert_eq!(periods[0].fatalities, 4);
        assert_eq!(store.len("event_date.contributions"), 2);
    }

    #[tokio::test]
    async fn increment_adds_zero_for_blank_fatalities() {
        let store = MemoryStore::new();
        let view = maintainer();
        let header = header();
        view.increment(&store, &record(&header, "1", "01/20/1994", "CESSNA", ""))
            .await
            .unwrap();
        let periods = view.periods(&store).await.unwrap();
        assert_eq!(periods[0].crashes, 1);
        assert_eq!(periods[0].fatalities, 0);
    }

    #[tokio::test]
    async fn field_views_group_by_make() {
        let store = seeded(&sample()).await;
        let view = ViewMaintainer::new(ViewDefinition::make(), SOURCE);
        view.rebuild(&store).await.unwrap();

        let entries = view.entries(&store).await.unwrap();
        let makes: Vec<(String, u64)> = entries
            .iter()
            .map(|e| (e.id.as_str().unwrap_or_default().to_owned(), e.value.get("crashes")))
            .collect();
        assert_eq!(
            makes,
            vec![
                ("BOEING".to_owned(), 1),
                ("CESSNA".to_owned(), 2),
                ("PIPER".to_owned(), 3),
            ]
        );
        assert!(view.periods(&store).await.is_err());
    }

    #[tokio::test]
    async fn blank_and_null_makes_are_separate_keys() {
        let header = header();
        let records = vec![
            record(&header, "1", "01/05/1994", "", "1"),
            record(&header, "2", "01/06/1994", "null", "0"),
            record(&header, "3", "01/07/1994", "", "0"),
        ];
        let store = seeded(&records).await;
        let view = ViewMaintainer::new(ViewDefinition::make(), SOURCE);
        view.rebuild(&store).await.unwrap();
        let rebuilt = view.entries(&store).await.unwrap();
        let counts: Vec<(Value, u64)> = rebuilt.iter().map(|e| (e.id.clone(), e.value.get("crashes"))).collect();
        assert_eq!(counts, vec![(json!(""), 2), (json!("null"), 1)]);

        let incremental = MemoryStore::new();
        for crash in &records {
            view.increment(&incremental, crash).await.unwrap();
        }
        assert_eq!(view.entries(&incremental).await.unwrap(), rebuilt);
    }

    #[test]
    fn period_keys_serialize_like_view_ids() {
        let key = PeriodKey::YearMonth { year: 1994, month: 0 };
        assert_eq!(serde_json::to_value(key).unwrap(), key.to_value());
        assert_eq!(PeriodKey::from_value(&json!({"year": 1994})), Some(PeriodKey::Year { year: 1994 }));
        assert_eq!(PeriodKey::from_value(&Value::Null), Some(PeriodKey::All));
        assert_eq!(PeriodKey::from_value(&json!("PIPER")), None);
    }
}
