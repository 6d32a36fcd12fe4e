use std::fs;

use anyhow::{Context, Result};
use tracing::debug;

use crate::pipeline::{Persister, SkipReason, Transform, Verdict};
use crate::record::{Filter, Record, RecordState};
use crate::store::{MediaImporter, RecordWriter};
use crate::url_map::ListMap;

pub const LEGACY_URL_META: &str = "_legacy_url";
pub const GALLERY_URLS_META: &str = "_legacy_gallery_urls";
pub const GALLERY_IDS_META: &str = "_gallery_ids";

/// Attaches the legacy gallery of each post, looked up by the post's original URL.
///
/// The transform only records which images belong to the post. Downloading them
/// happens in [`GalleryPersister`], so a dry run never touches the network.
pub struct LegacyGalleries {
    galleries: ListMap,
}

impl LegacyGalleries {
    pub fn new(galleries: ListMap) -> Self {
        Self { galleries }
    }

    pub fn filter() -> Filter {
        Filter::posts().with_meta(LEGACY_URL_META)
    }
}

impl Transform for LegacyGalleries {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        if record.state.meta_value(GALLERY_IDS_META).is_some() {
            return Ok(Verdict::Apply(record.state.clone()));
        }
        let legacy_url = record.state.meta_value(LEGACY_URL_META).unwrap_or_default();
        let images = match self.galleries.get(legacy_url) {
            None => {
                return Ok(Verdict::Skip(SkipReason::not_found(format!(
                    "no gallery listed for {legacy_url}"
                ))));
            }
            Some([]) => {
                return Ok(Verdict::Skip(SkipReason::not_found(format!(
                    "gallery for {legacy_url} is empty"
                ))));
            }
            Some(images) => images,
        };
        let mut state = record.state.clone();
        state.set_meta(
            GALLERY_URLS_META,
            serde_json::to_string(images).context("failed to encode gallery URL list")?,
        );
        Ok(Verdict::Apply(state))
    }
}

/// Imports the listed images, then writes the post with its gallery ids and shortcode.
///
/// Every image is fetched before anything is recorded. Attachment rows and the
/// post update share one atomic write; files created for a failed write are removed.
pub struct GalleryPersister<M, W> {
    importer: M,
    writer: W,
}

impl<M: MediaImporter, W: RecordWriter> GalleryPersister<M, W> {
    pub fn new(importer: M, writer: W) -> Self {
        Self { importer, writer }
    }
}

impl<M: MediaImporter, W: RecordWriter> Persister for GalleryPersister<M, W> {
    fn persist(&mut self, record: &Record, state: &RecordState) -> Result<()> {
        let Some(encoded) = state.meta_value(GALLERY_URLS_META) else {
            return self.writer.write(record, state);
        };
        if state.meta_value(GALLERY_IDS_META).is_some() {
            return self.writer.write(record, state);
        }
        let urls: Vec<String> = serde_json::from_str(encoded)
            .with_context(|| format!("invalid {GALLERY_URLS_META} on {}", record.label()))?;

        let mut fetched = Vec::with_capacity(urls.len());
        for url in &urls {
            let media = self
                .importer
                .fetch_media(url)
                .with_context(|| format!("failed to import gallery image {url}"))?;
            fetched.push(media);
        }

        let importer = &mut self.importer;
        let writer = &self.writer;
        let mut created_files = Vec::new();
        let written = writer.atomically(&mut || {
            let mut ids = Vec::with_capacity(fetched.len());
            for (media, url) in fetched.iter().zip(&urls) {
                let recorded = importer
                    .record_media(media, record.id)
                    .with_context(|| format!("failed to import gallery image {url}"))?;
                debug!(record = %record.label(), url = %url, attachment = recorded.id, "gallery image ready");
                created_files.extend(recorded.created_file);
                ids.push(recorded.id.to_string());
            }
            writer.write(record, &with_gallery(state, &ids.join(",")))
        });
        if written.is_err() {
            for path in &created_files {
                let _ = fs::remove_file(path);
            }
        }
        written
    }
}

fn with_gallery(state: &RecordState, joined: &str) -> RecordState {
    let mut final_state = state.clone();
    final_state.set_meta(GALLERY_IDS_META, joined);
    if !final_state.body.contains("[gallery") {
        if !final_state.body.is_empty() && !final_state.body.ends_with('\n') {
            final_state.body.push('\n');
        }
        final_state
            .body
            .push_str(&format!("\n[gallery ids=\"{joined}\"]"));
    }
    final_state
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::fs;

    use anyhow::{Result, bail};
    use tempfile::tempdir;

    use super::{
        GALLERY_IDS_META, GALLERY_URLS_META, GalleryPersister, LEGACY_URL_META, LegacyGalleries,
    };
    use crate::error::ErrorKind;
    use crate::media::StoreMediaImporter;
    use crate::outcome_log::OutcomeLog;
    use crate::pipeline::{Persister, RunOptions, Transform, Verdict, run_batch};
    use crate::record::{Filter, Record, RecordId, RecordKind, RecordState};
    use crate::remote::tests::CannedFetcher;
    use crate::store::{
        FetchedMedia, MediaImporter, MemorySource, NewPost, RecordSource, RecordWriter,
        RecordedMedia, SqliteStore,
    };
    use crate::transforms::test_support::{migrated_store, run_live};
    use crate::url_map::parse_list_map;

    const IMAGE_1: &str = "https://old.example.com/g/1.jpg";
    const IMAGE_2: &str = "https://old.example.com/g/2.jpg";

    #[derive(Default)]
    struct FakeImporter {
        next_id: RecordId,
        imported: BTreeMap<String, RecordId>,
        fail: Option<String>,
    }

    impl MediaImporter for FakeImporter {
        fn fetch_media(&mut self, url: &str) -> Result<FetchedMedia> {
            if self.fail.as_deref() == Some(url) {
                bail!("HTTP 500");
            }
            Ok(match self.imported.get(url) {
                Some(id) => FetchedMedia::Existing(*id),
                None => FetchedMedia::Downloaded {
                    url: url.to_string(),
                    body: Vec::new(),
                },
            })
        }

        fn record_media(&mut self, media: &FetchedMedia, _parent: RecordId) -> Result<RecordedMedia> {
            let id = match media {
                FetchedMedia::Existing(id) => *id,
                FetchedMedia::Downloaded { url, .. } => {
                    self.next_id += 1;
                    let id = 500 + self.next_id;
                    self.imported.insert(url.clone(), id);
                    id
                }
            };
            Ok(RecordedMedia {
                id,
                created_file: None,
            })
        }
    }

    #[derive(Default)]
    struct CapturingWriter {
        written: RefCell<Vec<RecordState>>,
    }

    impl RecordWriter for CapturingWriter {
        fn write(&self, _: &Record, state: &RecordState) -> Result<()> {
            self.written.borrow_mut().push(state.clone());
            Ok(())
        }
    }

    fn post(id: RecordId, legacy_url: &str) -> Record {
        let mut state = RecordState::with_body("<p>Fair photos</p>");
        state.set_meta(LEGACY_URL_META, legacy_url);
        Record::new(id, RecordKind::Post, state)
    }

    fn galleries() -> LegacyGalleries {
        LegacyGalleries::new(
            parse_list_map(
                r#"{"http://old.example.com/fair-2019/": ["https://old.example.com/g/1.jpg", "https://old.example.com/g/2.jpg"],
                    "http://old.example.com/empty": []}"#,
            )
            .expect("map"),
        )
    }

    #[test]
    fn transform_records_urls_and_skips_unknown_posts() {
        let mut transform = galleries();
        let Verdict::Apply(state) = transform
            .apply(&post(1, "https://old.example.com/fair-2019"))
            .expect("apply")
        else {
            panic!("expected apply");
        };
        assert_eq!(
            state.meta_value(GALLERY_URLS_META),
            Some(r#"["https://old.example.com/g/1.jpg","https://old.example.com/g/2.jpg"]"#)
        );

        for url in ["https://old.example.com/other", "http://old.example.com/empty"] {
            match transform.apply(&post(2, url)).expect("apply") {
                Verdict::Skip(reason) => assert_eq!(reason.kind(), ErrorKind::NotFound),
                Verdict::Apply(_) => panic!("expected skip for {url}"),
            }
        }
    }

    #[test]
    fn persister_imports_images_and_appends_shortcode() {
        let source = MemorySource::new(vec![post(1, "http://old.example.com/fair-2019")]);
        let writer = CapturingWriter::default();
        let mut persister = GalleryPersister::new(FakeImporter::default(), &writer);
        let mut log = OutcomeLog::with_sink("import-galleries", Vec::new());
        let summary = run_batch(
            &source,
            &LegacyGalleries::filter(),
            &mut galleries(),
            &mut persister,
            &mut log,
            RunOptions::default(),
        )
        .expect("run");
        assert_eq!(summary.updated, 1);

        let written = writer.written.borrow();
        assert_eq!(written[0].meta_value(GALLERY_IDS_META), Some("501,502"));
        assert!(written[0].body.ends_with("\n\n[gallery ids=\"501,502\"]"));

        let imported = Record::new(1, RecordKind::Post, written[0].clone());
        assert_eq!(
            galleries().apply(&imported).expect("apply"),
            Verdict::Apply(imported.state.clone())
        );
    }

    #[test]
    fn failed_import_writes_nothing() {
        let source = MemorySource::new(vec![post(1, "http://old.example.com/fair-2019")]);
        let writer = CapturingWriter::default();
        let importer = FakeImporter {
            fail: Some("https://old.example.com/g/2.jpg".to_string()),
            ..FakeImporter::default()
        };
        let mut persister = GalleryPersister::new(importer, &writer);
        let mut log = OutcomeLog::with_sink("import-galleries", Vec::new());
        let summary = run_batch(
            &source,
            &LegacyGalleries::filter(),
            &mut galleries(),
            &mut persister,
            &mut log,
            RunOptions::default(),
        )
        .expect("run");
        assert_eq!(summary.errored, 1);
        assert!(writer.written.borrow().is_empty());
    }

    fn stored_post(store: &SqliteStore) -> RecordId {
        store
            .insert_post(&NewPost {
                content: "<p>Fair photos</p>".to_string(),
                meta: vec![(
                    LEGACY_URL_META.to_string(),
                    "http://old.example.com/fair-2019/".to_string(),
                )],
                ..NewPost::default()
            })
            .expect("post")
    }

    fn attachments(store: &SqliteStore) -> Vec<Record> {
        store
            .find(&Filter::posts().record_type("attachment"))
            .expect("attachments")
    }

    fn files_in(dir: &std::path::Path) -> usize {
        fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[test]
    fn second_store_run_is_unchanged() {
        let temp = tempdir().expect("tempdir");
        let store = migrated_store(temp.path());
        let post_id = stored_post(&store);
        let uploads = temp.path().join("uploads");
        let mut fetcher = CannedFetcher::default()
            .with(IMAGE_1, 200, b"one")
            .with(IMAGE_2, 200, b"two");

        for (run, expected_updated) in [(0, 1), (1, 0)] {
            let mut persister = GalleryPersister::new(
                StoreMediaImporter::new(&store, &mut fetcher, &uploads),
                &store,
            );
            let summary = run_live(
                &store,
                &LegacyGalleries::filter(),
                &mut galleries(),
                &mut persister,
            );
            assert_eq!(summary.updated, expected_updated, "run {run}");
            assert_eq!(summary.processed(), 1, "run {run}");
        }
        assert_eq!(fetcher.requested.len(), 2);

        let ids = attachments(&store)
            .iter()
            .map(|record| record.id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let post = store
            .get(RecordKind::Post, post_id)
            .expect("get")
            .expect("post");
        assert_eq!(post.state.meta_value(GALLERY_IDS_META), Some(ids.as_str()));
        assert_eq!(files_in(&uploads), 2);
    }

    #[test]
    fn failed_image_leaves_no_attachments() {
        let temp = tempdir().expect("tempdir");
        let store = migrated_store(temp.path());
        stored_post(&store);
        let uploads = temp.path().join("uploads");
        let fetcher = CannedFetcher::default()
            .with(IMAGE_1, 200, b"one")
            .with(IMAGE_2, 404, b"");
        let mut persister =
            GalleryPersister::new(StoreMediaImporter::new(&store, fetcher, &uploads), &store);
        let summary = run_live(
            &store,
            &LegacyGalleries::filter(),
            &mut galleries(),
            &mut persister,
        );
        assert_eq!(summary.errored, 1);
        assert!(attachments(&store).is_empty());
        assert_eq!(files_in(&uploads), 0);
    }

    #[test]
    fn failed_post_write_rolls_back_attachments_and_files() {
        let temp = tempdir().expect("tempdir");
        let store = migrated_store(temp.path());
        let post_id = stored_post(&store);
        let uploads = temp.path().join("uploads");
        let fetcher = CannedFetcher::default()
            .with(IMAGE_1, 200, b"one")
            .with(IMAGE_2, 200, b"two");
        let record = store
            .get(RecordKind::Post, post_id)
            .expect("get")
            .expect("post");
        let Verdict::Apply(mut state) = galleries().apply(&record).expect("apply") else {
            panic!("expected apply");
        };
        state.categories.insert("No Such Category".to_string());

        let mut persister =
            GalleryPersister::new(StoreMediaImporter::new(&store, fetcher, &uploads), &store);
        assert!(persister.persist(&record, &state).is_err());
        assert!(attachments(&store).is_empty());
        assert_eq!(files_in(&uploads), 0);
        let unchanged = store
            .get(RecordKind::Post, post_id)
            .expect("get")
            .expect("post");
        assert_eq!(unchanged.state, record.state);
    }
}
