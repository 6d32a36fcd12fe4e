use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::configuration;

pub type RecordId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Post,
    User,
    Term,
    /// One data row of a delimited or JSON input file.
    Row,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::User => "user",
            Self::Term => "term",
            Self::Row => "row",
        }
    }

    /// Named fields a filter may reference for this kind.
    pub fn known_fields(self) -> &'static [&'static str] {
        match self {
            Self::Post => &[
                "post_type",
                "post_status",
                "post_title",
                "post_name",
                "post_parent",
                "post_author",
                "guid",
            ],
            Self::User => &["user_login", "display_name", "user_email"],
            Self::Term => &["name", "slug", "taxonomy", "parent"],
            Self::Row => &[],
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable part of a record. Change detection compares two of these with `==`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordState {
    pub body: String,
    pub fields: BTreeMap<String, String>,
    pub meta: BTreeMap<String, String>,
    pub categories: BTreeSet<String>,
}

impl RecordState {
    pub fn with_body(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) {
        self.meta.insert(key.to_string(), value.into());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    pub state: RecordState,
}

impl Record {
    pub fn new(id: RecordId, kind: RecordKind, state: RecordState) -> Self {
        Self { id, kind, state }
    }

    /// Short label used in log lines, e.g. `post 42`.
    pub fn label(&self) -> String {
        format!("{} {}", self.kind, self.id)
    }
}

/// First 8 bytes of the SHA-256 of `content`, hex encoded.
pub fn short_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPredicate {
    pub field: String,
    pub value: String,
}

/// Declarative selection of the records one run processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub kind: RecordKind,
    pub record_types: Vec<String>,
    pub statuses: Vec<String>,
    /// `None` selects every id; `Some(vec![])` selects nothing.
    pub ids: Option<Vec<RecordId>>,
    pub meta_present: Vec<String>,
    pub meta_absent: Vec<String>,
    pub body_contains: Option<String>,
    pub field_equals: Vec<FieldPredicate>,
}

impl Filter {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            record_types: Vec::new(),
            statuses: Vec::new(),
            ids: None,
            meta_present: Vec::new(),
            meta_absent: Vec::new(),
            body_contains: None,
            field_equals: Vec::new(),
        }
    }

    pub fn posts() -> Self {
        Self::new(RecordKind::Post)
    }

    pub fn users() -> Self {
        Self::new(RecordKind::User)
    }

    pub fn terms() -> Self {
        Self::new(RecordKind::Term)
    }

    pub fn record_type(mut self, value: impl Into<String>) -> Self {
        self.record_types.push(value.into());
        self
    }

    pub fn status(mut self, value: impl Into<String>) -> Self {
        self.statuses.push(value.into());
        self
    }

    pub fn ids(mut self, ids: &[RecordId]) -> Self {
        self.ids.get_or_insert_with(Vec::new).extend_from_slice(ids);
        self
    }

    /// Narrows the id selection to `ids`; an empty slice leaves it as is.
    pub fn restrict_ids(mut self, ids: &[RecordId]) -> Self {
        if ids.is_empty() {
            return self;
        }
        match &mut self.ids {
            Some(existing) => existing.retain(|id| ids.contains(id)),
            None => self.ids = Some(ids.to_vec()),
        }
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>) -> Self {
        self.meta_present.push(key.into());
        self
    }

    pub fn without_meta(mut self, key: impl Into<String>) -> Self {
        self.meta_absent.push(key.into());
        self
    }

    pub fn body_contains(mut self, needle: impl Into<String>) -> Self {
        self.body_contains = Some(needle.into());
        self
    }

    pub fn field_equals(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.field_equals.push(FieldPredicate {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Rejects predicates that reference fields the record kind does not have.
    pub fn validate(&self) -> anyhow::Result<()> {
        let known = self.kind.known_fields();
        for predicate in &self.field_equals {
            if !known.contains(&predicate.field.as_str()) {
                return Err(configuration(format!(
                    "filter references unknown {} field `{}`",
                    self.kind, predicate.field
                )));
            }
        }
        if !self.record_types.is_empty() && !matches!(self.kind, RecordKind::Post | RecordKind::Term)
        {
            return Err(configuration(format!(
                "record type filter is not supported for {} records",
                self.kind
            )));
        }
        if !self.statuses.is_empty() && self.kind != RecordKind::Post {
            return Err(configuration(format!(
                "status filter is not supported for {} records",
                self.kind
            )));
        }
        if self.kind == RecordKind::Term
            && (!self.meta_present.is_empty() || !self.meta_absent.is_empty())
        {
            return Err(configuration("terms carry no meta to filter on"));
        }
        Ok(())
    }

    /// In-memory evaluation, used by sources that hold records already.
    pub fn matches(&self, record: &Record) -> bool {
        if record.kind != self.kind {
            return false;
        }
        if let Some(ids) = &self.ids
            && !ids.contains(&record.id)
        {
            return false;
        }
        let type_field = match self.kind {
            RecordKind::Term => "taxonomy",
            _ => "post_type",
        };
        if !self.record_types.is_empty()
            && !record
                .state
                .field(type_field)
                .is_some_and(|value| self.record_types.iter().any(|wanted| wanted == value))
        {
            return false;
        }
        if !self.statuses.is_empty()
            && !record
                .state
                .field("post_status")
                .is_some_and(|value| self.statuses.iter().any(|wanted| wanted == value))
        {
            return false;
        }
        if self
            .meta_present
            .iter()
            .any(|key| !record.state.meta.contains_key(key))
        {
            return false;
        }
        if self
            .meta_absent
            .iter()
            .any(|key| record.state.meta.contains_key(key))
        {
            return false;
        }
        if let Some(needle) = &self.body_contains
            && !record.state.body.contains(needle.as_str())
        {
            return false;
        }
        self.field_equals
            .iter()
            .all(|predicate| record.state.field(&predicate.field) == Some(predicate.value.as_str()))
    }
}
