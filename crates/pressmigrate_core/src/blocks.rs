//! Tagged-pattern matching over HTML and shortcode markup.
//!
//! Publisher transforms never run their own regexes over post bodies. They ask
//! for the spans of one tag (`<img>`, `<figure>`, `[caption]`, ...) and rewrite
//! those spans, which keeps each transform testable on plain strings.
//!
//! Matching is flat: a paired tag closes at the first matching closing tag, so
//! nested blocks of the same tag are not supported.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::{Context, Result, bail};
use regex::Regex;

const VOID_HTML_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag<'a> {
    Html(&'a str),
    Shortcode(&'a str),
}

impl<'a> BlockTag<'a> {
    /// `[caption]` selects a shortcode, anything else an HTML element.
    pub fn parse(tag: &'a str) -> Self {
        let trimmed = tag.trim();
        match trimmed
            .strip_prefix('[')
            .and_then(|value| value.strip_suffix(']'))
        {
            Some(name) => Self::Shortcode(name),
            None => Self::Html(trimmed.trim_start_matches('<').trim_end_matches('>')),
        }
    }

    fn name(self) -> &'a str {
        match self {
            Self::Html(name) | Self::Shortcode(name) => name,
        }
    }
}

/// One occurrence of a tag in a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpan {
    /// Byte range of the whole block, opening tag through closing tag.
    pub range: Range<usize>,
    /// Byte range of the content between opening and closing tag, if paired.
    pub inner: Option<Range<usize>>,
    pub attributes: BTreeMap<String, String>,
}

impl BlockSpan {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn text<'t>(&self, source: &'t str) -> &'t str {
        &source[self.range.clone()]
    }

    pub fn inner_text<'t>(&self, source: &'t str) -> Option<&'t str> {
        self.inner.clone().map(|range| &source[range])
    }
}

pub struct BlockMatcher {
    open: Regex,
    close: Option<Regex>,
    attribute: Regex,
    shortcode: bool,
}

impl BlockMatcher {
    pub fn new(tag: BlockTag<'_>) -> Result<Self> {
        let name = tag.name();
        if name.is_empty()
            || !name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | ':'))
        {
            bail!("invalid block tag name: {name:?}");
        }
        let escaped = regex::escape(name);
        let (open, close, shortcode) = match tag {
            BlockTag::Html(_) => {
                let open = Regex::new(&format!(r"(?is)<{escaped}(?:\s[^>]*)?/?>"))
                    .context("failed to compile HTML open-tag pattern")?;
                let close = if VOID_HTML_TAGS.contains(&name.to_ascii_lowercase().as_str()) {
                    None
                } else {
                    Some(
                        Regex::new(&format!(r"(?i)</{escaped}\s*>"))
                            .context("failed to compile HTML close-tag pattern")?,
                    )
                };
                (open, close, false)
            }
            BlockTag::Shortcode(_) => {
                let open = Regex::new(&format!(r"(?s)\[{escaped}(?:\s[^\]]*)?\]"))
                    .context("failed to compile shortcode open pattern")?;
                let close = Regex::new(&format!(r"\[/{escaped}\]"))
                    .context("failed to compile shortcode close pattern")?;
                (open, Some(close), true)
            }
        };
        let attribute = Regex::new(
            r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>\]]+))"#,
        )
        .context("failed to compile attribute pattern")?;
        Ok(Self {
            open,
            close,
            attribute,
            shortcode,
        })
    }

    pub fn find(&self, text: &str) -> Vec<BlockSpan> {
        let mut spans = Vec::new();
        let mut cursor = 0usize;
        while cursor < text.len() {
            let Some(open) = self.open.find_at(text, cursor) else {
                break;
            };
            let open_text = open.as_str();
            let self_closing = !self.shortcode && open_text.ends_with("/>");
            let attributes = self.parse_attributes(open_text);

            let mut range = open.range();
            let mut inner = None;
            if !self_closing
                && let Some(close) = &self.close
                && let Some(found) = close.find_at(text, open.end())
            {
                // A second opener before the closer means this opener is unpaired.
                let next_open = self.open.find_at(text, open.end());
                if next_open.is_none_or(|next| next.start() >= found.start()) {
                    inner = Some(open.end()..found.start());
                    range = open.start()..found.end();
                }
            }

            cursor = range.end.max(open.start() + 1);
            spans.push(BlockSpan {
                range,
                inner,
                attributes,
            });
        }
        spans
    }

    fn parse_attributes(&self, open_tag: &str) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        // Skip the tag name so `<img-x` style names never parse as attributes.
        let body_start = open_tag
            .find(|ch: char| ch.is_whitespace())
            .unwrap_or(open_tag.len());
        for capture in self.attribute.captures_iter(&open_tag[body_start..]) {
            let name = capture
                .get(1)
                .map(|value| value.as_str().to_ascii_lowercase())
                .unwrap_or_default();
            let value = capture
                .get(2)
                .or_else(|| capture.get(3))
                .or_else(|| capture.get(4))
                .map(|value| value.as_str().to_string())
                .unwrap_or_default();
            attributes.entry(name).or_insert(value);
        }
        attributes
    }
}

/// All spans of `tag` in `text`, in document order.
pub fn find_blocks(tag: &str, text: &str) -> Result<Vec<BlockSpan>> {
    Ok(BlockMatcher::new(BlockTag::parse(tag))?.find(text))
}

/// Applies non-overlapping replacements, given in any order.
pub fn replace_ranges(text: &str, mut replacements: Vec<(Range<usize>, String)>) -> Result<String> {
    replacements.sort_by_key(|(range, _)| range.start);
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for (range, replacement) in replacements {
        if range.start < cursor || range.end > text.len() || range.start > range.end {
            bail!(
                "overlapping or out-of-bounds replacement at {}..{}",
                range.start,
                range.end
            );
        }
        output.push_str(&text[cursor..range.start]);
        output.push_str(&replacement);
        cursor = range.end;
    }
    output.push_str(&text[cursor..]);
    Ok(output)
}

/// Byte range of one attribute's value inside an opening tag, quotes excluded.
pub fn attribute_value_range(open_tag: &str, name: &str) -> Result<Option<Range<usize>>> {
    let pattern = format!(
        r#"(?i)\s{}\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>\]]+))"#,
        regex::escape(name)
    );
    let regex = Regex::new(&pattern).context("failed to compile attribute value pattern")?;
    Ok(regex
        .captures(open_tag)
        .and_then(|capture| capture.get(1).or_else(|| capture.get(2)).or_else(|| capture.get(3)))
        .map(|value| value.range()))
}
