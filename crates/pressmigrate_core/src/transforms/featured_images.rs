use anyhow::{Context, Result};
use regex::Regex;

use crate::blocks::find_blocks;
use crate::pipeline::{SkipReason, Transform, Verdict};
use crate::record::{Filter, Record, RecordId};
use crate::store::RecordSource;

pub const THUMBNAIL_META: &str = "_thumbnail_id";

/// Sets a post's featured image from the single `<img>` in its body.
///
/// The image must resolve to exactly one attachment by `guid`. Resized
/// renditions (`photo-300x200.jpg`) fall back to the original file name.
pub struct FeaturedImageFromBody<S> {
    attachments: S,
    size_suffix: Regex,
}

impl<S: RecordSource> FeaturedImageFromBody<S> {
    pub fn new(attachments: S) -> Result<Self> {
        let size_suffix =
            Regex::new(r"-\d+x\d+(\.[A-Za-z0-9]+)$").context("failed to compile size pattern")?;
        Ok(Self {
            attachments,
            size_suffix,
        })
    }

    pub fn filter(post_type: &str) -> Filter {
        Filter::posts()
            .record_type(post_type)
            .without_meta(THUMBNAIL_META)
            .body_contains("<img")
    }

    fn lookup(&self, src: &str) -> Result<Vec<RecordId>> {
        let by_guid = |guid: &str| -> Result<Vec<RecordId>> {
            Ok(self
                .attachments
                .find(
                    &Filter::posts()
                        .record_type("attachment")
                        .field_equals("guid", guid),
                )?
                .into_iter()
                .map(|record| record.id)
                .collect())
        };
        let without_query = src.split(['?', '#']).next().unwrap_or(src);
        let exact = by_guid(without_query)?;
        if !exact.is_empty() {
            return Ok(exact);
        }
        let original = self.size_suffix.replace(without_query, "$1");
        if original == without_query {
            return Ok(exact);
        }
        by_guid(original.as_ref())
    }
}

impl<S: RecordSource> Transform for FeaturedImageFromBody<S> {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        let sources = find_blocks("img", &record.state.body)?
            .into_iter()
            .filter_map(|span| {
                span.attribute("src")
                    .map(str::trim)
                    .filter(|src| !src.is_empty())
                    .map(str::to_string)
            })
            .collect::<Vec<_>>();
        let src = match sources.as_slice() {
            [] => return Ok(Verdict::Skip(SkipReason::not_found("no <img> with a src in body"))),
            [single] => single,
            several => {
                return Ok(Verdict::Skip(SkipReason::ambiguous(format!(
                    "{} images in body",
                    several.len()
                ))));
            }
        };

        let attachment = match self.lookup(src)?.as_slice() {
            [] => {
                return Ok(Verdict::Skip(SkipReason::not_found(format!(
                    "no attachment for {src}"
                ))));
            }
            [id] => *id,
            several => {
                return Ok(Verdict::Skip(SkipReason::ambiguous(format!(
                    "{} attachments for {src}",
                    several.len()
                ))));
            }
        };
        let mut state = record.state.clone();
        state.set_meta(THUMBNAIL_META, attachment.to_string());
        Ok(Verdict::Apply(state))
    }
}
