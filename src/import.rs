//! Import entry point: file to base collection, then index and views.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::batch::{BatchAccumulator, FlushedBatch, ImportStats};
use crate::config::{ImportConfig, ViewMode};
use crate::error::ImportError;
use crate::source::RecordReader;
use crate::store::{DocumentStore, StoreError};
use crate::view::{ViewDefinition, ViewMaintainer};

/// What happened to one view during an import.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewReport {
    pub name: String,
    pub mode: ViewMode,
    /// Source documents read by a rebuild, or records folded in incrementally.
    pub records: u64,
    /// Keys in the view after a rebuild. Not tracked incrementally.
    pub keys: Option<usize>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub stats: ImportStats,
    pub views: Vec<ViewReport>,
}

pub struct Importer<'a, S> {
    store: &'a S,
    config: ImportConfig,
    drop_existing: bool,
}

impl<'a, S: DocumentStore> Importer<'a, S> {
    pub fn new(store: &'a S, config: ImportConfig) -> Importer<'a, S> {
        Importer {
            store,
            config,
            drop_existing: false,
        }
    }

    /// Drop the collection and its views before importing.
    pub fn with_drop(mut self, drop_existing: bool) -> Importer<'a, S> {
        self.drop_existing = drop_existing;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Imports `path` into `collection`. Stops at the first bad line or
    /// failed write; batches flushed before that stay in the store.
    pub async fn run(&self, path: &Path, collection: &str) -> Result<ImportReport, ImportError> {
        let views = self.views(collection)?;
        if self.drop_existing {
            self.drop_collections(collection, &views).await?;
        }

        log::info!("Importing {} into {} ...", path.display(), collection);
        let reader = RecordReader::open(path)?;
        let mut batch = BatchAccumulator::new(self.store, collection, self.config.checkpoint);
        let mut applied = vec![0u64; views.len()];
        let started = Instant::now();

        for record in reader {
            if let Some(flushed) = batch.append(record?).await? {
                self.fold(&views, &flushed, &mut applied).await?;
            }
        }
        if let Some(flushed) = batch.finish().await? {
            self.fold(&views, &flushed, &mut applied).await?;
        }
        let stats = batch.stats();

        log::info!("Creating index on {} ...", self.config.index_field);
        self.store
            .create_index(collection, &self.config.index_field, self.config.index_direction)
            .await?;

        let views = match self.config.view_mode {
            ViewMode::Rebuild => rebuild_all(self.store, &views).await?,
            ViewMode::Incremental => {
                let elapsed = started.elapsed();
                views
                    .iter()
                    .zip(applied)
                    .map(|(view, records)| ViewReport {
                        name: view.view_collection().to_owned(),
                        mode: ViewMode::Incremental,
                        records,
                        keys: None,
                        elapsed,
                    })
                    .collect()
            }
        };

        Ok(ImportReport { stats, views })
    }

    /// Rebuilds every configured view of `collection` without importing.
    pub async fn rebuild_views(&self, collection: &str) -> Result<Vec<ViewReport>, ImportError> {
        let views = self.views(collection)?;
        Ok(rebuild_all(self.store, &views).await?)
    }

    fn views(&self, collection: &str) -> Result<Vec<ViewMaintainer>, ImportError> {
        let definitions = ViewDefinition::load_dir(&self.config.views_dir)?;
        log::debug!(
            "Loaded {} view definition(s) from {}",
            definitions.len(),
            self.config.views_dir.display()
        );
        Ok(definitions
            .into_iter()
            .map(|definition| ViewMaintainer::new(definition, collection))
            .collect())
    }

    async fn drop_collections(&self, collection: &str, views: &[ViewMaintainer]) -> Result<(), StoreError> {
        log::info!("Dropping {collection} and its views ...");
        self.store.drop_collection(collection).await?;
        for view in views {
            self.store.drop_collection(view.view_collection()).await?;
            self.store
                .drop_collection(&view.contributions_collection())
                .await?;
        }
        Ok(())
    }

    async fn fold(
        &self,
        views: &[ViewMaintainer],
        flushed: &FlushedBatch,
        applied: &mut [u64],
    ) -> Result<(), StoreError> {
        if self.config.view_mode != ViewMode::Incremental {
            return Ok(());
        }
        for (view, count) in views.iter().zip(applied.iter_mut()) {
            for (id, record) in flushed.iter() {
                if view.increment_once(self.store, id, record).await? {
                    *count += 1;
                }
            }
        }
        Ok(())
    }
}

async fn rebuild_all<S: DocumentStore>(
    store: &S,
    views: &[ViewMaintainer],
) -> Result<Vec<ViewReport>, StoreError> {
    let mut reports = Vec::with_capacity(views.len());
    for view in views {
        let started = Instant::now();
        let output = view.rebuild(store).await?;
        let elapsed = started.elapsed();
        log::info!(
            "Created view {} in {:.3} seconds",
            view.view_collection(),
            elapsed.as_secs_f64()
        );
        reports.push(ViewReport {
            name: view.view_collection().to_owned(),
            mode: ViewMode::Rebuild,
            records: output.input,
            keys: Some(output.results.len()),
            elapsed,
        });
    }
    Ok(reports)
}
