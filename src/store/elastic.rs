use std::collections::HashSet;
use std::ops::Bound;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use elasticsearch::auth::Credentials;
use elasticsearch::cert::CertificateValidation;
use elasticsearch::http::response::Response;
use elasticsearch::http::transport::SingleNodeConnectionPool;
use elasticsearch::http::transport::TransportBuilder;
use elasticsearch::http::{StatusCode, Url};
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesPutMappingParts,
    IndicesRefreshParts,
};
use elasticsearch::{
    BulkOperation, BulkOperations, BulkParts, CountParts, CreateParts, Elasticsearch, GetParts,
    ClearScrollParts, ScrollParts, SearchParts, UpdateParts,
};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::document::{add_to_path, compare_values, document_key, Document, ID_FIELD};
use super::{BulkInsert, DocumentStore, Filter, FindOptions, SortDirection, StoreError};
use crate::record::EVENT_DATE;

/// Source field holding the key of a keyed document (view entries, ledgers).
const VIEW_KEY_FIELD: &str = "view_key";

const SCROLL_KEEP_ALIVE: &str = "1m";

const BULK_CHUNK: usize = 10_000;

const INCREMENT_SCRIPT: &str = r#"
for (entry in params.inc.entrySet()) {
  def parts = entry.getKey().splitOnToken('.');
  def target = ctx._source;
  for (int i = 0; i < parts.length - 1; ++i) {
    if (!(target[parts[i]] instanceof Map)) {
      target[parts[i]] = new HashMap();
    }
    target = target[parts[i]];
  }
  def leaf = parts[parts.length - 1];
  target[leaf] = (target[leaf] == null ? 0 : target[leaf]) + entry.getValue();
}
"#;

const DEFAULT_URI: &str = "http://localhost:9200/";
const DEFAULT_DATABASE: &str = "aviation";
const DEFAULT_PAGE_SIZE: usize = 1_000;
const DEFAULT_RETRY_ON_CONFLICT: u32 = 5;

/// [`DocumentStore`] backed by Elasticsearch. A collection is the index
/// `<database>.<collection>`.
pub struct ElasticStore {
    client: Elasticsearch,
    database: String,
    page_size: usize,
    retry_on_conflict: u32,
    prepared: Mutex<HashSet<String>>,
    dirty: Mutex<HashSet<String>>,
}

impl ElasticStore {
    pub fn builder() -> ElasticStoreBuilder {
        ElasticStoreBuilder::new()
    }

    pub fn index_name(&self, collection: &str) -> String {
        format!("{}.{}", self.database, collection).to_lowercase()
    }

    fn mark_dirty(&self, index: &str) {
        self.dirty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index.to_owned());
    }

    /// Makes writes visible to the next read of `index`.
    async fn refresh_if_dirty(&self, index: &str) -> Result<(), StoreError> {
        let was_dirty = self
            .dirty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(index);
        if was_dirty {
            let response = self
                .client
                .indices()
                .refresh(IndicesRefreshParts::Index(&[index]))
                .send()
                .await?;
            expect_success(response, |reason| StoreError::Query {
                collection: index.to_owned(),
                reason,
            })
            .await?;
        }
        Ok(())
    }

    /// Creates `index` with keyword strings and a dated `Event Date` unless it
    /// already exists.
    async fn ensure_index(&self, index: &str) -> Result<(), StoreError> {
        if self
            .prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(index)
        {
            return Ok(());
        }

        let exists = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[index]))
            .send()
            .await?;
        if !index_exists(index, exists.status_code())? {
            log::debug!("Creating index {index}");
            let response = self
                .client
                .indices()
                .create(IndicesCreateParts::Index(index))
                .body(json!({
                    "mappings": {
                        "dynamic_templates": [{
                            "strings_as_keywords": {
                                "match_mapping_type": "string",
                                "mapping": { "type": "keyword" }
                            }
                        }],
                        "properties": {
                            EVENT_DATE: { "type": "date", "format": "yyyy-MM-dd" }
                        }
                    }
                }))
                .send()
                .await?;
            let status = response.status_code();
            if !status.is_success() {
                let body = response.text().await?;
                if !body.contains("resource_already_exists_exception") {
                    return Err(StoreError::Index {
                        collection: index.to_owned(),
                        reason: format!("{status}: {body}"),
                    });
                }
            }
        }

        self.prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index.to_owned());
        Ok(())
    }

    async fn bulk_index(&self, index: &str, documents: Vec<Document>) -> Result<(), StoreError> {
        for chunk in documents.chunks(BULK_CHUNK) {
            let mut ops = BulkOperations::new();
            for document in chunk {
                let (id, source) = to_source(document.clone());
                ops.push(BulkOperation::index(source).id(id))?;
            }
            let response = self
                .client
                .bulk(BulkParts::Index(index))
                .body(vec![ops])
                .send()
                .await?;
            summarize_bulk_response(index, response).await?;
        }
        self.mark_dirty(index);
        Ok(())
    }

    async fn search_page(&self, index: &str, body: Value, size: usize) -> Result<Option<Value>, StoreError> {
        let response = self
            .client
            .search(SearchParts::Index(&[index]))
            .scroll(SCROLL_KEEP_ALIVE)
            .size(size as i64)
            .body(body)
            .send()
            .await?;
        if response.status_code() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response, |reason| StoreError::Query {
            collection: index.to_owned(),
            reason,
        })
        .await?;
        Ok(Some(response.json::<Value>().await?))
    }

    /// Releases a scroll context. The documents were already read, so a
    /// failure here is only logged.
    async fn clear_scroll(&self, scroll_id: &str) {
        let result = self
            .client
            .clear_scroll(ClearScrollParts::None)
            .body(json!({ "scroll_id": [scroll_id] }))
            .send()
            .await;
        match result {
            Ok(response) if response.status_code().is_success() => {}
            Ok(response) => log::warn!("Clearing scroll returned {}", response.status_code()),
            Err(e) => log::warn!("Clearing scroll failed: {e}"),
        }
    }

    async fn scroll_page(&self, index: &str, scroll_id: &str) -> Result<Value, StoreError> {
        let response = self
            .client
            .scroll(ScrollParts::None)
            .body(json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id }))
            .send()
            .await?;
        let response = expect_success(response, |reason| StoreError::Query {
            collection: index.to_owned(),
            reason,
        })
        .await?;
        Ok(response.json::<Value>().await?)
    }
}

#[derive(Debug, PartialEq)]
enum Scroll {
    Start(Value),
    Next { scroll_id: String, fetched: usize },
    Done,
}

/// A scroll ends once a page comes back empty or `limit` documents have been
/// read. A `limit` of 0 reads everything.
fn next_scroll(scroll_id: Option<&str>, hits: usize, fetched: usize, limit: usize) -> Scroll {
    match scroll_id {
        Some(scroll_id) if hits > 0 && (limit == 0 || fetched < limit) => Scroll::Next {
            scroll_id: scroll_id.to_owned(),
            fetched,
        },
        _ => Scroll::Done,
    }
}

/// 404 means the index is missing. Any other failure is an error rather than
/// an index to trust.
fn index_exists(index: &str, status: StatusCode) -> Result<bool, StoreError> {
    if status == StatusCode::NOT_FOUND {
        Ok(false)
    } else if status.is_success() {
        Ok(true)
    } else {
        Err(StoreError::Index {
            collection: index.to_owned(),
            reason: format!("existence check returned {status}"),
        })
    }
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn bulk_insert<T>(&self, collection: &str, items: &[T]) -> Result<BulkInsert, StoreError>
    where
        T: Serialize + Sync,
    {
        if items.is_empty() {
            return Ok(BulkInsert::default());
        }
        let index = self.index_name(collection);
        self.ensure_index(&index).await?;

        let mut ids = Vec::with_capacity(items.len());
        for chunk in items.chunks(BULK_CHUNK) {
            let mut ops = BulkOperations::new();
            for item in chunk {
                ops.push(BulkOperation::index(item))?;
            }
            let response = self
                .client
                .bulk(BulkParts::Index(&index))
                .body(vec![ops])
                .send()
                .await?;
            ids.extend(summarize_bulk_response(&index, response).await?);
        }
        self.mark_dirty(&index);
        Ok(BulkInsert { ids })
    }

    async fn create_index(
        &self,
        collection: &str,
        field: &str,
        direction: SortDirection,
    ) -> Result<(), StoreError> {
        let index = self.index_name(collection);
        self.ensure_index(&index).await?;
        let response = self
            .client
            .indices()
            .put_mapping(IndicesPutMappingParts::Index(&[index.as_str()]))
            .body(json!({
                "_meta": { "indexes": object(field, json!(direction.as_str())) },
                "properties": object(field, json!({ "type": "keyword" })),
            }))
            .send()
            .await?;
        expect_success(response, |reason| StoreError::Index {
            collection: collection.to_owned(),
            reason,
        })
        .await?;
        Ok(())
    }

    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: &'a Filter,
        options: &'a FindOptions,
    ) -> BoxStream<'a, Result<Document, StoreError>> {
        let index = self.index_name(collection);
        let limit = options.limit;
        let size = if limit > 0 {
            limit.min(self.page_size)
        } else {
            self.page_size
        };
        let body = search_body(filter, options);

        let pages = stream::try_unfold(Scroll::Start(body), move |state| {
            let index = index.clone();
            async move {
                let (page, fetched) = match state {
                    Scroll::Done => return Ok::<_, StoreError>(None),
                    Scroll::Start(body) => {
                        self.refresh_if_dirty(&index).await?;
                        match self.search_page(&index, body, size).await? {
                            Some(page) => (page, 0),
                            None => return Ok(None),
                        }
                    }
                    Scroll::Next { scroll_id, fetched } => {
                        (self.scroll_page(&index, &scroll_id).await?, fetched)
                    }
                };

                let scroll_id = page["_scroll_id"].as_str();
                let hits = page["hits"]["hits"]
                    .as_array()
                    .ok_or_else(|| StoreError::Response("search response has no hits".to_owned()))?;
                let fetched = fetched + hits.len();
                let next = next_scroll(scroll_id, hits.len(), fetched, limit);
                if let (Scroll::Done, Some(scroll_id)) = (&next, scroll_id) {
                    self.clear_scroll(scroll_id).await;
                }
                if hits.is_empty() {
                    return Ok(None);
                }
                let documents: Vec<Document> = hits.iter().map(hit_to_document).collect();
                Ok(Some((documents, next)))
            }
        });

        let documents = pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten();
        if limit > 0 {
            documents.take(limit).boxed()
        } else {
            documents.boxed()
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let index = self.index_name(collection);
        let response = self.client.get(GetParts::IndexId(&index, id)).send().await?;
        if response.status_code() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response, |reason| StoreError::Query {
            collection: collection.to_owned(),
            reason,
        })
        .await?;
        let hit = response.json::<Value>().await?;
        if hit["found"].as_bool() != Some(true) {
            return Ok(None);
        }
        Ok(Some(hit_to_document(&hit)))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let index = self.index_name(collection);
        self.refresh_if_dirty(&index).await?;
        let response = self
            .client
            .count(CountParts::Index(&[index.as_str()]))
            .body(json!({ "query": to_query(filter) }))
            .send()
            .await?;
        if response.status_code() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let response = expect_success(response, |reason| StoreError::Query {
            collection: collection.to_owned(),
            reason,
        })
        .await?;
        let body = response.json::<Value>().await?;
        body["count"]
            .as_u64()
            .ok_or_else(|| StoreError::Response("count response has no count".to_owned()))
    }

    async fn group_count(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<(Value, u64)>, StoreError> {
        let index = self.index_name(collection);
        self.refresh_if_dirty(&index).await?;

        let mut groups = Vec::new();
        let mut after: Option<Value> = None;
        loop {
            let mut composite = json!({
                "size": self.page_size,
                "sources": [{ "group": { "terms": { "field": es_field(field), "missing_bucket": true } } }]
            });
            if let Some(after_key) = after.take() {
                composite["after"] = after_key;
            }
            let response = self
                .client
                .search(SearchParts::Index(&[index.as_str()]))
                .body(json!({
                    "size": 0,
                    "query": to_query(filter),
                    "aggs": { "groups": { "composite": composite } }
                }))
                .send()
                .await?;
            if response.status_code() == StatusCode::NOT_FOUND {
                break;
            }
            let response = expect_success(response, |reason| StoreError::Query {
                collection: collection.to_owned(),
                reason,
            })
            .await?;
            let body = response.json::<Value>().await?;
            let aggregation = &body["aggregations"]["groups"];
            let buckets = aggregation["buckets"].as_array().cloned().unwrap_or_default();
            if buckets.is_empty() {
                break;
            }
            for bucket in buckets {
                groups.push((
                    bucket["key"]["group"].clone(),
                    bucket["doc_count"].as_u64().unwrap_or(0),
                ));
            }
            match aggregation.get("after_key") {
                Some(after_key) => after = Some(after_key.clone()),
                None => break,
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
        let index = self.index_name(collection);
        self.ensure_index(&index).await?;

        let mut params = Map::new();
        let mut upsert = Document::new();
        upsert.insert(VIEW_KEY_FIELD.to_owned(), selector.clone());
        for (path, delta) in increments {
            params.insert(path.clone(), json!(delta));
            add_to_path(&mut upsert, path, *delta).map_err(|reason| StoreError::Write {
                collection: collection.to_owned(),
                reason,
            })?;
        }

        let id = document_key(selector);
        let response = self
            .client
            .update(UpdateParts::IndexId(&index, &id))
            .retry_on_conflict(i64::from(self.retry_on_conflict))
            .body(json!({
                "script": { "lang": "painless", "source": INCREMENT_SCRIPT, "params": { "inc": params } },
                "upsert": upsert,
            }))
            .send()
            .await?;
        expect_success(response, |reason| StoreError::Write {
            collection: collection.to_owned(),
            reason,
        })
        .await?;
        self.mark_dirty(&index);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        collection: &str,
        id: &Value,
        document: Document,
    ) -> Result<bool, StoreError> {
        let index = self.index_name(collection);
        self.ensure_index(&index).await?;

        let mut document = document;
        document.insert(ID_FIELD.to_owned(), id.clone());
        let (doc_id, source) = to_source(document);
        let response = self
            .client
            .create(CreateParts::IndexId(&index, &doc_id))
            .body(source)
            .send()
            .await?;
        if response.status_code() == StatusCode::CONFLICT {
            return Ok(false);
        }
        expect_success(response, |reason| StoreError::Write {
            collection: collection.to_owned(),
            reason,
        })
        .await?;
        self.mark_dirty(&index);
        Ok(true)
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        let index = self.index_name(collection);
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&[index.as_str()]))
            .send()
            .await?;
        self.prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
        self.dirty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
        if response.status_code() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success(response, |reason| StoreError::Write {
            collection: collection.to_owned(),
            reason,
        })
        .await?;
        Ok(())
    }

    async fn replace_collection(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        self.drop_collection(collection).await?;
        let index = self.index_name(collection);
        self.ensure_index(&index).await?;
        self.bulk_index(&index, documents).await
    }
}

async fn expect_success<F>(response: Response, error: F) -> Result<Response, StoreError>
where
    F: FnOnce(String) -> StoreError,
{
    let status = response.status_code();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await?;
    Err(error(format!("{status}: {body}")))
}

/// Collects the ids assigned by a bulk request. Any rejected item fails the
/// whole call.
async fn summarize_bulk_response(index: &str, response: Response) -> Result<Vec<String>, StoreError> {
    let response = expect_success(response, |reason| StoreError::Write {
        collection: index.to_owned(),
        reason,
    })
    .await?;
    let response = response.json::<Value>().await?;
    let items = response["items"]
        .as_array()
        .ok_or_else(|| StoreError::Response("bulk response has no items".to_owned()))?;

    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let Some(result) = item.get("index") else {
            return Err(StoreError::Response(
                "found response besides index".to_owned(),
            ));
        };
        if let Some(error) = result.get("error") {
            return Err(StoreError::Write {
                collection: index.to_owned(),
                reason: error.to_string(),
            });
        }
        ids.push(result["_id"].as_str().unwrap_or_default().to_owned());
    }
    Ok(ids)
}

/// Splits a keyed document into its Elasticsearch id and source. The key
/// travels in the source and the id is its compact JSON, which is never
/// empty.
fn to_source(mut document: Document) -> (String, Document) {
    let key = document.remove(ID_FIELD).unwrap_or(Value::Null);
    let id = document_key(&key);
    document.insert(VIEW_KEY_FIELD.to_owned(), key);
    (id, document)
}

fn hit_to_document(hit: &Value) -> Document {
    let mut source = hit["_source"].as_object().cloned().unwrap_or_default();
    let id = source
        .remove(VIEW_KEY_FIELD)
        .unwrap_or_else(|| hit["_id"].clone());
    let mut document = Document::with_capacity(source.len() + 1);
    document.insert(ID_FIELD.to_owned(), id);
    document.extend(source);
    document
}

fn object(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_owned(), value);
    Value::Object(map)
}

fn es_field(field: &str) -> String {
    match field.strip_prefix("_id.") {
        Some(rest) => format!("{VIEW_KEY_FIELD}.{rest}"),
        None => field.to_owned(),
    }
}

fn to_query(filter: &Filter) -> Value {
    match filter {
        Filter::All => json!({ "match_all": {} }),
        Filter::Eq { field, value } if value.is_null() => json!({
            "bool": { "must_not": { "exists": { "field": es_field(field) } } }
        }),
        Filter::Eq { field, value } => json!({ "term": object(&es_field(field), value.clone()) }),
        Filter::Range { field, from, to } => {
            let mut bounds = Map::new();
            match from {
                Bound::Included(v) => {
                    bounds.insert("gte".to_owned(), v.clone());
                }
                Bound::Excluded(v) => {
                    bounds.insert("gt".to_owned(), v.clone());
                }
                Bound::Unbounded => {}
            }
            match to {
                Bound::Included(v) => {
                    bounds.insert("lte".to_owned(), v.clone());
                }
                Bound::Excluded(v) => {
                    bounds.insert("lt".to_owned(), v.clone());
                }
                Bound::Unbounded => {}
            }
            json!({ "range": object(&es_field(field), Value::Object(bounds)) })
        }
        Filter::And(filters) => json!({
            "bool": { "filter": filters.iter().map(to_query).collect::<Vec<_>>() }
        }),
    }
}

fn search_body(filter: &Filter, options: &FindOptions) -> Value {
    let sort: Vec<Value> = if options.sort.is_empty() {
        vec![json!("_doc")]
    } else {
        options
            .sort
            .iter()
            .map(|(field, direction)| object(&es_field(field), json!({ "order": direction.as_str() })))
            .collect()
    };
    let mut body = json!({ "query": to_query(filter), "sort": sort });
    if let Some(fields) = &options.fields {
        let mut includes: Vec<String> = fields.iter().map(|f| es_field(f)).collect();
        includes.push(VIEW_KEY_FIELD.to_owned());
        body["_source"] = json!(includes);
    }
    body
}

pub struct ElasticStoreBuilder {
    uri: String,
    credentials: Option<Credentials>,
    database: String,
    page_size: usize,
    retry_on_conflict: u32,
}

impl ElasticStoreBuilder {
    pub fn new() -> ElasticStoreBuilder {
        ElasticStoreBuilder {
            uri: String::from(DEFAULT_URI),
            credentials: None,
            database: String::from(DEFAULT_DATABASE),
            page_size: DEFAULT_PAGE_SIZE,
            retry_on_conflict: DEFAULT_RETRY_ON_CONFLICT,
        }
    }

    pub fn with_uri(mut self, uri: String) -> ElasticStoreBuilder {
        self.uri = uri;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> ElasticStoreBuilder {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_database(mut self, database: String) -> ElasticStoreBuilder {
        self.database = database;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> ElasticStoreBuilder {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_retry_on_conflict(mut self, retries: u32) -> ElasticStoreBuilder {
        self.retry_on_conflict = retries;
        self
    }

    pub fn build(self) -> Result<ElasticStore, StoreError> {
        let url = Url::parse(&self.uri)
            .map_err(|e| StoreError::InvalidConfiguration(format!("bad uri {}: {e}", self.uri)))?;
        let conn_pool = SingleNodeConnectionPool::new(url);
        let mut transport_builder = TransportBuilder::new(conn_pool)
            .disable_proxy()
            .cert_validation(CertificateValidation::None);
        if let Some(credentials) = self.credentials {
            transport_builder = transport_builder.auth(credentials);
        }
        let transport = transport_builder
            .build()
            .map_err(|e| StoreError::InvalidConfiguration(e.to_string()))?;
        if self.database.is_empty() {
            return Err(StoreError::InvalidConfiguration(
                "database name is required".to_owned(),
            ));
        }
        Ok(ElasticStore {
            client: Elasticsearch::new(transport),
            database: self.database,
            page_size: self.page_size,
            retry_on_conflict: self.retry_on_conflict,
            prepared: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
        })
    }
}

impl Default for ElasticStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
