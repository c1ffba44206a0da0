use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use super::document::{add_to_path, compare_values, get_path, Document, ID_FIELD};
use super::{BulkInsert, DocumentStore, Filter, FindOptions, SortDirection, StoreError};

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<(String, SortDirection)>,
}

impl Collection {
    fn position(&self, id: &Value) -> Option<usize> {
        self.documents.iter().position(|document| {
            document
                .get(ID_FIELD)
                .is_some_and(|existing| existing == id)
        })
    }

    fn is_indexed(&self, field: &str) -> bool {
        self.indexes.iter().any(|(indexed, _)| indexed == field)
    }
}

/// In-process [`DocumentStore`]. Every operation takes one lock, so each call
/// is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    next_id: AtomicU64,
    bulk_sizes: Mutex<Vec<usize>>,
    unindexed_sort_limit: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Rejects sorts on unindexed fields that would order more than `limit`
    /// documents, the way a store without an index on the sort key does.
    pub fn with_unindexed_sort_limit(mut self, limit: usize) -> MemoryStore {
        self.unindexed_sort_limit = Some(limit);
        self
    }

    /// Sizes of every bulk insert issued so far.
    pub fn bulk_insert_sizes(&self) -> Vec<usize> {
        self.bulk_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .get(collection)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock().get(collection).map_or(0, |c| c.documents.len())
    }

    pub fn indexes(&self, collection: &str) -> Vec<(String, SortDirection)> {
        self.lock()
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Collection>> {
        self.collections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generate_id(&self) -> String {
        format!("{:024x}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn with_id(id: Value, document: Document) -> Document {
        let mut stored = Document::with_capacity(document.len() + 1);
        stored.insert(ID_FIELD.to_owned(), id);
        stored.extend(document.into_iter().filter(|(k, _)| k != ID_FIELD));
        stored
    }

    fn select(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>, StoreError> {
        let collections = self.lock();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<Document> = coll
            .documents
            .iter()
            .filter(|document| filter.matches(document))
            .cloned()
            .collect();
        let indexed = options.sort.iter().all(|(field, _)| coll.is_indexed(field));
        drop(collections);

        if !options.sort.is_empty() {
            if let Some(max) = self.unindexed_sort_limit {
                let bounded = options.limit > 0 && options.limit <= max;
                if !indexed && !bounded && matched.len() > max {
                    return Err(StoreError::Query {
                        collection: collection.to_owned(),
                        reason: "too much data for sort() with no index; add an index or specify a smaller limit".to_owned(),
                    });
                }
            }
            matched.sort_by(|a, b| {
                options
                    .sort
                    .iter()
                    .map(|(field, direction)| {
                        let ordering = compare_values(
                            get_path(a, field).unwrap_or(&Value::Null),
                            get_path(b, field).unwrap_or(&Value::Null),
                        );
                        match direction {
                            SortDirection::Ascending => ordering,
                            SortDirection::Descending => ordering.reverse(),
                        }
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if options.limit > 0 {
            matched.truncate(options.limit);
        }

        if let Some(fields) = &options.fields {
            matched = matched
                .into_iter()
                .map(|document| {
                    let mut projected = Document::new();
                    if let Some(id) = document.get(ID_FIELD) {
                        projected.insert(ID_FIELD.to_owned(), id.clone());
                    }
                    for field in fields {
                        if let Some(value) = get_path(&document, field) {
                            projected.insert(field.clone(), value.clone());
                        }
                    }
                    projected
                })
                .collect();
        }
        Ok(matched)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn bulk_insert<T>(&self, collection: &str, items: &[T]) -> Result<BulkInsert, StoreError>
    where
        T: Serialize + Sync,
    {
        let mut documents = Vec::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let Value::Object(document) = serde_json::to_value(item)? else {
                return Err(StoreError::Write {
                    collection: collection.to_owned(),
                    reason: "document is not an object".to_owned(),
                });
            };
            let id = self.generate_id();
            documents.push(MemoryStore::with_id(Value::String(id.clone()), document));
            ids.push(id);
        }

        self.lock()
            .entry(collection.to_owned())
            .or_default()
            .documents
            .extend(documents);
        self.bulk_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(items.len());
        Ok(BulkInsert { ids })
    }

    async fn create_index(
        &self,
        collection: &str,
        field: &str,
        direction: SortDirection,
    ) -> Result<(), StoreError> {
        let mut collections = self.lock();
        let coll = collections.entry(collection.to_owned()).or_default();
        if !coll.is_indexed(field) {
            coll.indexes.push((field.to_owned(), direction));
        }
        Ok(())
    }

    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxStream<'a, Result<Document, StoreError>> {
        match self.select(collection, filter, options) {
            Ok(documents) => stream::iter(documents.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let id = Value::String(id.to_owned());
        let collections = self.lock();
        Ok(collections
            .get(collection)
            .and_then(|c| c.position(&id).map(|idx| c.documents[idx].clone())))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let collections = self.lock();
        Ok(collections.get(collection).map_or(0, |c| {
            c.documents.iter().filter(|d| filter.matches(d)).count() as u64
        }))
    }

    async fn group_count(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<(Value, u64)>, StoreError> {
        let mut groups: Vec<(Value, u64)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        {
            let collections = self.lock();
            if let Some(coll) = collections.get(collection) {
                for document in coll.documents.iter().filter(|d| filter.matches(d)) {
                    let value = get_path(document, field).cloned().unwrap_or(Value::Null);
                    let key = value.to_string();
                    match positions.get(&key) {
                        Some(&idx) => groups[idx].1 += 1,
                        None => {
                            positions.insert(key, groups.len());
                            groups.push((value, 1));
                        }
                    }
                }
            }
        }
        groups.sort_by(|(a_key, a_count), (b_key, b_count)| {
            b_count.cmp(a_count).then_with(|| compare_values(a_key, b_key))
        });
        Ok(groups)
    }

    async fn upsert_increment(
        &self,
        collection: &str,
        selector: &Value,
        increments: &[(String, u64)],
    ) -> Result<(), StoreError> {
        let mut collections = self.lock();
        let coll = collections.entry(collection.to_owned()).or_default();
        let idx = match coll.position(selector) {
            Some(idx) => idx,
            None => {
                coll.documents
                    .push(MemoryStore::with_id(selector.clone(), Document::new()));
                coll.documents.len() - 1
            }
        };
        let document = &mut coll.documents[idx];
        for (path, delta) in increments {
            add_to_path(document, path, *delta).map_err(|reason| StoreError::Write {
                collection: collection.to_owned(),
                reason,
            })?;
        }
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        id: &Value,
        document: Document,
    ) -> Result<bool, StoreError> {
        let mut collections = self.lock();
        let coll = collections.entry(collection.to_owned()).or_default();
        if coll.position(id).is_some() {
            return Ok(false);
        }
        coll.documents.push(MemoryStore::with_id(id.clone(), document));
        Ok(true)
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.lock().remove(collection);
        Ok(())
    }

    async fn replace_collection(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        self.lock().insert(
            collection.to_owned(),
            Collection {
                documents,
                indexes: Vec::new(),
            },
        );
        Ok(())
    }
}
