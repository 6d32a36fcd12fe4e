//! Collaborator interfaces for the target content store, plus the SQLite
//! implementation of the generic content schema.

mod schema;
mod sqlite;

use std::path::PathBuf;

use anyhow::Result;

use crate::record::{Filter, Record, RecordId, RecordState};

pub use schema::{AppliedSchemaMigration, SchemaReport, latest_version};
pub use sqlite::{NewPost, NewTerm, NewUser, SqliteStore, StoreStats};

/// Produces the candidate set for a run.
pub trait RecordSource {
    /// Materialized matches in ascending id order. No match is `Ok(vec![])`.
    fn find(&self, filter: &Filter) -> Result<Vec<Record>>;
}

/// Writes one record's new state as a single atomic operation.
pub trait RecordWriter {
    fn write(&self, record: &Record, state: &RecordState) -> Result<()>;

    /// Runs `work` so that either every write inside it lands or none does.
    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        work()
    }
}

/// Category lookup and creation.
pub trait Taxonomy {
    /// Ids of categories whose name matches case-insensitively.
    fn find_categories(&self, name: &str) -> Result<Vec<RecordId>>;
    fn create_category(&self, name: &str) -> Result<RecordId>;
}

/// A media URL after lookup or download, before anything has been recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedMedia {
    Existing(RecordId),
    Downloaded { url: String, body: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMedia {
    pub id: RecordId,
    /// File created by this call, if any. Removed again when the surrounding write fails.
    pub created_file: Option<PathBuf>,
}

/// Imports remote files as attachments.
///
/// Fetching has no side effects. Recording writes the file and the attachment
/// row and is expected to run inside [`RecordWriter::atomically`].
pub trait MediaImporter {
    fn fetch_media(&mut self, url: &str) -> Result<FetchedMedia>;
    fn record_media(&mut self, media: &FetchedMedia, parent: RecordId) -> Result<RecordedMedia>;

    /// Fetch and record in one step; returns the attachment id.
    fn import_media(&mut self, url: &str, parent: RecordId) -> Result<RecordId> {
        let media = self.fetch_media(url)?;
        Ok(self.record_media(&media, parent)?.id)
    }
}

impl<T: RecordSource + ?Sized> RecordSource for &T {
    fn find(&self, filter: &Filter) -> Result<Vec<Record>> {
        (**self).find(filter)
    }
}

impl<T: RecordWriter + ?Sized> RecordWriter for &T {
    fn write(&self, record: &Record, state: &RecordState) -> Result<()> {
        (**self).write(record, state)
    }

    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        (**self).atomically(work)
    }
}

impl<T: Taxonomy + ?Sized> Taxonomy for &T {
    fn find_categories(&self, name: &str) -> Result<Vec<RecordId>> {
        (**self).find_categories(name)
    }

    fn create_category(&self, name: &str) -> Result<RecordId> {
        (**self).create_category(name)
    }
}

/// Source over records already in memory, e.g. rows of an input file.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Vec<Record>,
}

impl MemorySource {
    pub fn new(mut records: Vec<Record>) -> Self {
        records.sort_by_key(|record| record.id);
        Self { records }
    }
}

impl RecordSource for MemorySource {
    fn find(&self, filter: &Filter) -> Result<Vec<Record>> {
        filter.validate()?;
        Ok(self
            .records
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }
}
