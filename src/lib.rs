//! Imports pipe-delimited aviation crash reports into a document store and
//! maintains aggregation views over them.
//!
//! The pipeline reads a (possibly gzipped) export with [`source::RecordReader`],
//! writes it in checkpointed batches through [`batch::BatchAccumulator`],
//! indexes `Make` and then rebuilds or incrementally updates every view
//! defined in the views directory. [`reports`] holds the read-side queries.

pub mod batch;
pub mod config;
pub mod error;
pub mod import;
pub mod record;
pub mod reports;
pub mod source;
pub mod store;
pub mod view;

pub use error::ImportError;
pub use import::{ImportReport, Importer};
pub use store::{DocumentStore, ElasticStore, MemoryStore, StoreError};
