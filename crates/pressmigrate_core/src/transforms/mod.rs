//! One transform per legacy data shape. Each is a plain struct built per run.

pub mod avatars;
pub mod featured_images;
pub mod fix_images;
pub mod galleries;
pub mod headings;
pub mod post_type_category;
pub mod reparent_terms;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use crate::outcome_log::OutcomeLog;
    use crate::pipeline::{Persister, RunOptions, RunSummary, Transform, run_batch};
    use crate::record::Filter;
    use crate::store::{RecordSource, SqliteStore};

    pub(crate) fn migrated_store(dir: &Path) -> SqliteStore {
        let store = SqliteStore::open(&dir.join("site.db")).expect("open");
        store.migrate().expect("migrate");
        store
    }

    /// One live run with the log kept in memory.
    pub(crate) fn run_live<S, T, P>(
        source: &S,
        filter: &Filter,
        transform: &mut T,
        persister: &mut P,
    ) -> RunSummary
    where
        S: RecordSource + ?Sized,
        T: Transform + ?Sized,
        P: Persister + ?Sized,
    {
        let mut log = OutcomeLog::with_sink("test", Vec::new());
        run_batch(source, filter, transform, persister, &mut log, RunOptions::default())
            .expect("run")
    }
}
