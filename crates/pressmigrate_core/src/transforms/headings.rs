use std::borrow::Cow;

use anyhow::{Context, Result};
use regex::{Captures, Regex};

use crate::pipeline::{Transform, Verdict};
use crate::record::{Filter, Record};

/// Turns markdown headings left in HTML bodies into heading elements.
pub struct MarkdownHeadings {
    pattern: Regex,
}

impl MarkdownHeadings {
    pub fn new() -> Result<Self> {
        // Level 1-6, optional space, text, optional closing hashes, then newline or end.
        let pattern = Regex::new(r"(?m)^(#{1,6})[ \t]*([^#\s][^\r\n]*?)[ \t]*#*[ \t]*(?:\r?\n|\z)")
            .context("failed to compile heading pattern")?;
        Ok(Self { pattern })
    }

    pub fn filter(post_type: &str) -> Filter {
        Filter::posts().record_type(post_type).body_contains("#")
    }

    pub fn convert<'t>(&self, text: &'t str) -> Cow<'t, str> {
        self.pattern.replace_all(text, |captures: &Captures<'_>| {
            let level = captures[1].len();
            format!("<h{level}>{}</h{level}>", captures[2].trim_end())
        })
    }
}

impl Transform for MarkdownHeadings {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        let mut state = record.state.clone();
        if let Cow::Owned(converted) = self.convert(&record.state.body) {
            state.body = converted;
        }
        Ok(Verdict::Apply(state))
    }
}
