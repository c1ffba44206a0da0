//! Document store capability used by the import pipeline, the aggregation
//! views and the reports.
//!
//! [`DocumentStore`] is the only seam between this crate and a concrete
//! store. [`ElasticStore`] talks to Elasticsearch; [`MemoryStore`] keeps
//! everything in process for dry runs and tests.

mod document;
mod elastic;
mod filter;
mod map_reduce;
mod memory;

pub use document::{add_to_path, compare_values, document_key, get_path, Document, ID_FIELD};
pub use elastic::{ElasticStore, ElasticStoreBuilder};
pub use filter::Filter;
pub use map_reduce::{Counters, Mapper, Reduced, Reducer, SumReducer};
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::{BoxStream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection to document store failed: {0}")]
    Transport(#[from] elasticsearch::Error),

    #[error("invalid store configuration: {0}")]
    InvalidConfiguration(String),

    #[error("query against `{collection}` failed: {reason}")]
    Query { collection: String, reason: String },

    #[error("index build on `{collection}` failed: {reason}")]
    Index { collection: String, reason: String },

    #[error("write to `{collection}` failed: {reason}")]
    Write { collection: String, reason: String },

    #[error("unexpected response from document store: {0}")]
    Response(String),

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        }
    }
}

/// Projection, ordering and cap applied to a [`DocumentStore::find`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Fields to return besides `_id`. `None` returns whole documents.
    pub fields: Option<Vec<String>>,
    pub sort: Vec<(String, SortDirection)>,
    /// 0 means no limit.
    pub limit: usize,
}

impl FindOptions {
    pub fn new() -> FindOptions {
        FindOptions::default()
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> FindOptions
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> FindOptions {
        self.sort.push((field.into(), direction));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> FindOptions {
        self.limit = limit;
        self
    }
}

/// Where map/reduce results go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputMode {
    #[default]
    Inline,
    /// Replace the named collection with the results.
    Materialized(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapReduceOptions {
    /// Applied to the source collection before the map phase.
    pub query: Filter,
    pub output: OutputMode,
    /// Maximum number of input documents, 0 means all.
    pub limit: usize,
}

impl MapReduceOptions {
    pub fn inline() -> MapReduceOptions {
        MapReduceOptions::default()
    }

    pub fn materialized(collection: impl Into<String>) -> MapReduceOptions {
        MapReduceOptions {
            output: OutputMode::Materialized(collection.into()),
            ..MapReduceOptions::default()
        }
    }

    pub fn with_query(mut self, query: Filter) -> MapReduceOptions {
        self.query = query;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> MapReduceOptions {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapReduceOutput {
    /// One entry per key, ordered by key.
    pub results: Vec<Reduced>,
    pub input: u64,
    pub emitted: u64,
    pub collection: Option<String>,
}

/// Store-assigned ids of a bulk insert, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsert {
    pub ids: Vec<String>,
}

impl BulkInsert {
    pub fn inserted(&self) -> usize {
        self.ids.len()
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts every item as a new document. Missing collections are created.
    async fn bulk_insert<T>(&self, collection: &str, items: &[T]) -> Result<BulkInsert, StoreError>
    where
        T: Serialize + Sync;

    async fn create_index(
        &self,
        collection: &str,
        field: &str,
        direction: SortDirection,
    ) -> Result<(), StoreError>;

    /// Lazily streams matching documents. The stream is single pass.
    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxStream<'a, Result<Document, StoreError>>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Number of documents per distinct value of `field`, most frequent first.
    async fn group_count(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<(Value, u64)>, StoreError>;

    /// Atomically adds `increments` to the counters of the document whose id
    /// is `selector`, creating it with those values when absent.
    async fn upsert_increment(
        &self,
        collection: &str,
        selector: &Value,
        increments: &[(String, u64)],
    ) -> Result<(), StoreError>;

    /// Returns false, leaving the store untouched, when `id` already exists.
    async fn insert_if_absent(
        &self,
        collection: &str,
        id: &Value,
        document: Document,
    ) -> Result<bool, StoreError>;

    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError>;

    /// Replaces the whole contents of `collection`. Each document carries its
    /// own `_id`.
    async fn replace_collection(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), StoreError>;

    async fn map_reduce(
        &self,
        collection: &str,
        mapper: &dyn Mapper,
        reducer: &dyn Reducer,
        options: &MapReduceOptions,
    ) -> Result<MapReduceOutput, StoreError> {
        let find_options = FindOptions::new().with_limit(options.limit);
        let mut documents = self.find(collection, &options.query, &find_options);
        let mut engine = map_reduce::Engine::new(mapper, reducer);
        while let Some(document) = documents.try_next().await? {
            engine.feed(&document);
        }
        drop(documents);

        let mut output = engine.finish();
        if let OutputMode::Materialized(target) = &options.output {
            let documents = output.results.iter().map(Reduced::to_document).collect();
            self.replace_collection(target, documents).await?;
            output.collection = Some(target.clone());
        }
        Ok(output)
    }
}
