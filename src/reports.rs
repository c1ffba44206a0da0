//! Read-only queries over an imported collection.

use chrono::NaiveDate;
use futures::TryStreamExt;
use serde_json::Value;

use crate::record::{EVENT_DATE, MAKE};
use crate::store::{
    Document, DocumentStore, Filter, FindOptions, MapReduceOptions, Reduced, SortDirection,
    StoreError, SumReducer,
};
use crate::view::{AggregatedPeriod, GroupBy, Period, ViewDefinition, ViewMaintainer};

async fn collect<S: DocumentStore>(
    store: &S,
    collection: &str,
    filter: &Filter,
    options: &FindOptions,
) -> Result<Vec<Document>, StoreError> {
    store.find(collection, filter, options).try_collect().await
}

fn makes_sorted(limit: usize) -> FindOptions {
    FindOptions::new()
        .with_fields([MAKE])
        .with_sort(MAKE, SortDirection::Descending)
        .with_limit(limit)
}

pub async fn find_by_id<S: DocumentStore>(
    store: &S,
    collection: &str,
    id: &str,
) -> Result<Option<Document>, StoreError> {
    store.get(collection, id).await
}

/// Crashes with `from <= Event Date < to`.
pub async fn find_by_range<S: DocumentStore>(
    store: &S,
    collection: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<Document>, StoreError> {
    let filter = Filter::date_range(EVENT_DATE, from, to);
    collect(store, collection, &filter, &FindOptions::new()).await
}

/// Ids and makes of every crash, makes descending. Needs an index on `Make`
/// unless `limit` keeps the sort small.
pub async fn find_all_makes<S: DocumentStore>(
    store: &S,
    collection: &str,
    limit: usize,
) -> Result<Vec<Document>, StoreError> {
    collect(store, collection, &Filter::All, &makes_sorted(limit)).await
}

pub async fn find_by_make<S: DocumentStore>(
    store: &S,
    collection: &str,
    make: &str,
    limit: usize,
) -> Result<Vec<Document>, StoreError> {
    collect(store, collection, &Filter::eq(MAKE, make), &makes_sorted(limit)).await
}

pub async fn count_by_make<S: DocumentStore>(
    store: &S,
    collection: &str,
    make: &str,
) -> Result<u64, StoreError> {
    store.count(collection, &Filter::eq(MAKE, make)).await
}

pub async fn count_by_make_map_reduce<S: DocumentStore>(
    store: &S,
    collection: &str,
    make: &str,
) -> Result<u64, StoreError> {
    let options = MapReduceOptions::inline().with_query(Filter::eq(MAKE, make));
    let output = store
        .map_reduce(collection, &ViewDefinition::make(), &SumReducer, &options)
        .await?;
    Ok(output
        .results
        .iter()
        .map(|reduced| reduced.value.get("crashes"))
        .sum())
}

/// Crashes per make, most crashes first.
pub async fn group_by_make<S: DocumentStore>(
    store: &S,
    collection: &str,
) -> Result<Vec<(Value, u64)>, StoreError> {
    store.group_count(collection, MAKE, &Filter::All).await
}

/// Crashes per make, ordered by make. `limit` caps the documents read.
pub async fn group_by_make_map_reduce<S: DocumentStore>(
    store: &S,
    collection: &str,
    limit: usize,
) -> Result<Vec<Reduced>, StoreError> {
    let options = MapReduceOptions::inline().with_limit(limit);
    let output = store
        .map_reduce(collection, &ViewDefinition::make(), &SumReducer, &options)
        .await?;
    Ok(output.results)
}

/// Crashes and fatalities per period computed from the base collection,
/// e.g. restricted to one make with `Filter::eq("Make", ..)`.
pub async fn crashes_by_period<S: DocumentStore>(
    store: &S,
    collection: &str,
    period: Period,
    filter: Filter,
) -> Result<Vec<AggregatedPeriod>, StoreError> {
    let maintainer = ViewMaintainer::new(ViewDefinition::event_date(), collection);
    let output = maintainer
        .aggregate(store, GroupBy::from(period), filter, 0)
        .await?;
    Ok(output
        .results
        .iter()
        .filter_map(AggregatedPeriod::from_reduced)
        .collect())
}
