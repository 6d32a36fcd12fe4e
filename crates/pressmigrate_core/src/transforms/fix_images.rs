use anyhow::Result;
use tracing::debug;

use crate::blocks::{attribute_value_range, find_blocks, replace_ranges};
use crate::error::configuration;
use crate::pipeline::{SkipReason, Transform, Verdict};
use crate::record::{Filter, Record};
use crate::remote::RemoteFetcher;

/// Rewrites `<img src>` URLs under a legacy prefix to a new prefix.
///
/// With a verifier attached, every rewritten URL must answer 200 before the
/// record is changed; otherwise the record is skipped untouched.
pub struct ImagePrefixRewrite<F> {
    from: String,
    to: String,
    verifier: Option<F>,
}

impl<F: RemoteFetcher> ImagePrefixRewrite<F> {
    pub fn new(from: &str, to: &str, verifier: Option<F>) -> Result<Self> {
        let from = from.trim();
        let to = to.trim();
        if from.is_empty() {
            return Err(configuration("--from prefix cannot be empty"));
        }
        if from == to {
            return Err(configuration("--from and --to prefixes are identical"));
        }
        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
            verifier,
        })
    }

    pub fn filter(&self, post_type: &str) -> Filter {
        Filter::posts()
            .record_type(post_type)
            .body_contains(self.from.clone())
    }

    /// New body plus the rewritten URLs, in document order.
    pub fn rewrite(&self, body: &str) -> Result<(String, Vec<String>)> {
        let mut replacements = Vec::new();
        let mut rewritten = Vec::new();
        for span in find_blocks("img", body)? {
            let tag = span.text(body);
            let Some(value) = attribute_value_range(tag, "src")? else {
                continue;
            };
            let src = &tag[value.clone()];
            // A target nested under the legacy prefix still matches after a rewrite.
            if self.to.starts_with(self.from.as_str()) && src.starts_with(self.to.as_str()) {
                continue;
            }
            let Some(rest) = src.strip_prefix(self.from.as_str()) else {
                continue;
            };
            let new_src = format!("{}{rest}", self.to);
            let start = span.range.start + value.start;
            let end = span.range.start + value.end;
            replacements.push((start..end, new_src.clone()));
            rewritten.push(new_src);
        }
        Ok((replace_ranges(body, replacements)?, rewritten))
    }

    fn verify(&mut self, urls: &[String]) -> Option<SkipReason> {
        let fetcher = self.verifier.as_mut()?;
        for url in urls {
            match fetcher.get(url) {
                Ok(response) if response.is_ok() => {
                    debug!(url, "verified rewritten image");
                }
                Ok(response) => {
                    return Some(SkipReason::external(format!(
                        "HTTP {} for {url}",
                        response.status
                    )));
                }
                Err(error) => return Some(SkipReason::external(format!("{error:#}"))),
            }
        }
        None
    }
}

impl<F: RemoteFetcher> Transform for ImagePrefixRewrite<F> {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        let (body, rewritten) = self.rewrite(&record.state.body)?;
        if rewritten.is_empty() {
            return Ok(Verdict::Apply(record.state.clone()));
        }
        if let Some(reason) = self.verify(&rewritten) {
            return Ok(Verdict::Skip(reason));
        }
        let mut state = record.state.clone();
        state.body = body;
        Ok(Verdict::Apply(state))
    }
}
