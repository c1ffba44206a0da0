//! Buffers records and flushes them to the store in fixed-size batches.

use std::fmt;
use std::ops::AddAssign;
use std::time::{Duration, Instant};

use crate::record::Record;
use crate::store::{DocumentStore, StoreError};

pub const DEFAULT_CHECKPOINT: usize = 1_000;

/// Running totals of an import.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImportStats {
    pub documents: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

impl ImportStats {
    pub fn new() -> ImportStats {
        ImportStats::default()
    }

    /// Documents per second, 0 before any time has passed.
    pub fn rate(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.documents as f64 / seconds
        } else {
            0.0
        }
    }
}

impl AddAssign for ImportStats {
    fn add_assign(&mut self, other: Self) {
        self.documents += other.documents;
        self.batches += other.batches;
        self.elapsed += other.elapsed;
    }
}

impl fmt::Display for ImportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Imported: {} document(s) in {:.3} seconds",
            self.documents,
            self.elapsed.as_secs_f64()
        )?;
        write!(f, "Rate: {:.3} document(s) / second", self.rate())
    }
}

/// Records written by one flush, paired with the ids the store gave them.
#[derive(Debug, Clone)]
pub struct FlushedBatch {
    pub records: Vec<Record>,
    pub ids: Vec<String>,
}

impl FlushedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Record)> {
        self.ids.iter().map(String::as_str).zip(self.records.iter())
    }
}

pub struct BatchAccumulator<'a, S> {
    store: &'a S,
    collection: String,
    checkpoint: usize,
    pending: Vec<Record>,
    stats: ImportStats,
    started: Instant,
}

impl<'a, S: DocumentStore> BatchAccumulator<'a, S> {
    /// A checkpoint of 0 is treated as 1.
    pub fn new(store: &'a S, collection: impl Into<String>, checkpoint: usize) -> BatchAccumulator<'a, S> {
        let checkpoint = checkpoint.max(1);
        BatchAccumulator {
            store,
            collection: collection.into(),
            checkpoint,
            pending: Vec::with_capacity(checkpoint),
            stats: ImportStats::new(),
            started: Instant::now(),
        }
    }

    /// Adds a record, flushing once the batch reaches the checkpoint.
    pub async fn append(&mut self, record: Record) -> Result<Option<FlushedBatch>, StoreError> {
        self.pending.push(record);
        if self.pending.len() >= self.checkpoint {
            self.flush().await
        } else {
            Ok(None)
        }
    }

    /// Writes the pending records. On error they are dropped, batches that
    /// were already flushed stay in the store.
    pub async fn flush(&mut self) -> Result<Option<FlushedBatch>, StoreError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let records = std::mem::replace(&mut self.pending, Vec::with_capacity(self.checkpoint));
        let inserted = self.store.bulk_insert(&self.collection, &records).await?;

        self.stats.documents += records.len();
        self.stats.batches += 1;
        self.stats.elapsed = self.started.elapsed();
        log::info!(
            "Imported: {} document(s) in {:.3} seconds",
            self.stats.documents,
            self.stats.elapsed.as_secs_f64()
        );

        Ok(Some(FlushedBatch {
            records,
            ids: inserted.ids,
        }))
    }

    /// Flushes whatever is left. An empty batch touches nothing.
    pub async fn finish(&mut self) -> Result<Option<FlushedBatch>, StoreError> {
        let flushed = self.flush().await?;
        self.stats.elapsed = self.started.elapsed();
        Ok(flushed)
    }

    pub fn stats(&self) -> ImportStats {
        self.stats
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::record::Header;
    use crate::store::MemoryStore;

    fn records(n: usize) -> Vec<Record> {
        let header = Arc::new(Header::parse("Event Id|Event Date|Make").unwrap());
        (0..n)
            .map(|i| Record::parse(&header, &format!("{i}|01/0{}/1994|PIPER", i + 1)).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn flushes_at_each_checkpoint() {
        let store = MemoryStore::new();
        let mut batch = BatchAccumulator::new(&store, "crashes", 1);
        for record in records(3) {
            let flushed = batch.append(record).await.unwrap().unwrap();
            assert_eq!(flushed.len(), 1);
            assert_eq!(flushed.ids.len(), 1);
        }
        assert!(batch.finish().await.unwrap().is_none());

        assert_eq!(store.bulk_insert_sizes(), vec![1, 1, 1]);
        assert_eq!(batch.stats().documents, 3);
        assert_eq!(batch.stats().batches, 3);
    }

    #[tokio::test]
    async fn finish_flushes_the_remainder() {
        let store = MemoryStore::new();
        let mut batch = BatchAccumulator::new(&store, "crashes", 2);
        let mut flushed = Vec::new();
        for record in records(3) {
            flushed.extend(batch.append(record).await.unwrap());
        }
        assert_eq!(batch.pending(), 1);
        flushed.extend(batch.finish().await.unwrap());

        assert_eq!(store.bulk_insert_sizes(), vec![2, 1]);
        let ids: Vec<&str> = flushed.iter().flat_map(|b| b.iter().map(|(id, _)| id)).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(store.len("crashes"), 3);
    }

    #[test]
    fn formats_statistics() {
        let stats = ImportStats {
            documents: 3,
            batches: 1,
            elapsed: Duration::from_millis(1_500),
        };
        assert_eq!(
            stats.to_string(),
            "Imported: 3 document(s) in 1.500 seconds\nRate: 2.000 document(s) / second"
        );
        assert_eq!(ImportStats::new().rate(), 0.0);

        let mut total = ImportStats::new();
        total += stats;
        total += stats;
        assert_eq!((total.documents, total.batches), (6, 2));
    }
}
