use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::error::MigrationError;
use crate::record::{Filter, RecordId, short_hash};
use crate::remote::{RemoteFetcher, file_name_from_url};
use crate::store::{
    FetchedMedia, MediaImporter, NewPost, RecordSource, RecordedMedia, SqliteStore,
};

pub const ATTACHED_FILE_META: &str = "_attached_file";
pub const CONTENT_HASH_META: &str = "_content_hash";

/// Downloads media into the uploads directory and records it as an attachment post.
///
/// A URL that already has an attachment (matched on `guid`) is not fetched again,
/// so an interrupted import can be re-run. Content-addressed files that already
/// exist on disk are reused, not rewritten.
pub struct StoreMediaImporter<'a, F> {
    store: &'a SqliteStore,
    fetcher: F,
    uploads_dir: PathBuf,
}

impl<'a, F: RemoteFetcher> StoreMediaImporter<'a, F> {
    pub fn new(store: &'a SqliteStore, fetcher: F, uploads_dir: &Path) -> Self {
        Self {
            store,
            fetcher,
            uploads_dir: uploads_dir.to_path_buf(),
        }
    }

    fn existing_attachment(&self, url: &str) -> Result<Option<RecordId>> {
        let found = self.store.find(
            &Filter::posts()
                .record_type("attachment")
                .field_equals("guid", url),
        )?;
        match found.as_slice() {
            [] => Ok(None),
            [record] => Ok(Some(record.id)),
            several => Err(MigrationError::Ambiguous(format!(
                "{} attachments already use guid {url}",
                several.len()
            ))
            .into()),
        }
    }
}

impl<F: RemoteFetcher> MediaImporter for StoreMediaImporter<'_, F> {
    fn fetch_media(&mut self, url: &str) -> Result<FetchedMedia> {
        if let Some(id) = self.existing_attachment(url)? {
            return Ok(FetchedMedia::Existing(id));
        }

        let response = self.fetcher.get(url)?;
        if !response.is_ok() {
            return Err(MigrationError::ExternalFetchFailure(format!(
                "HTTP {} for {url}",
                response.status
            ))
            .into());
        }
        Ok(FetchedMedia::Downloaded {
            url: url.to_string(),
            body: response.body,
        })
    }

    fn record_media(&mut self, media: &FetchedMedia, parent: RecordId) -> Result<RecordedMedia> {
        let (url, body) = match media {
            FetchedMedia::Existing(id) => {
                return Ok(RecordedMedia {
                    id: *id,
                    created_file: None,
                });
            }
            FetchedMedia::Downloaded { url, body } => (url.as_str(), body.as_slice()),
        };
        // The same URL may appear twice in one batch.
        if let Some(id) = self.existing_attachment(url)? {
            return Ok(RecordedMedia {
                id,
                created_file: None,
            });
        }

        let hash = short_hash(body);
        let file_name = sanitize_file_name(file_name_from_url(url).unwrap_or("media"));
        let relative = format!("{hash}-{file_name}");
        let target = self.uploads_dir.join(&relative);
        fs::create_dir_all(&self.uploads_dir).with_context(|| {
            format!("failed to create uploads directory {}", self.uploads_dir.display())
        })?;
        let created_file = if target.exists() {
            None
        } else {
            fs::write(&target, body)
                .with_context(|| format!("failed to write {}", target.display()))?;
            Some(target)
        };

        let title = file_name
            .rsplit_once('.')
            .map_or(file_name.as_str(), |(stem, _)| stem)
            .to_string();
        let inserted = self.store.insert_post(&NewPost {
            post_type: "attachment".to_string(),
            post_status: "inherit".to_string(),
            title,
            name: file_name.clone(),
            parent,
            guid: url.to_string(),
            meta: vec![
                (ATTACHED_FILE_META.to_string(), relative),
                (CONTENT_HASH_META.to_string(), hash),
            ],
            ..NewPost::default()
        });
        let id = match inserted {
            Ok(id) => id,
            Err(error) => {
                if let Some(path) = &created_file {
                    let _ = fs::remove_file(path);
                }
                return Err(error);
            }
        };
        info!(url, attachment = id, parent, "imported media");
        Ok(RecordedMedia { id, created_file })
    }
}

fn sanitize_file_name(value: &str) -> String {
    let cleaned = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '-'
            }
        })
        .collect::<String>();
    let trimmed = cleaned.trim_matches(|ch| ch == '.' || ch == '-');
    if trimmed.is_empty() {
        "media".to_string()
    } else {
        trimmed.to_string()
    }
}
