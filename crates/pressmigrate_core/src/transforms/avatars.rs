use anyhow::Result;

use crate::error::configuration;
use crate::pipeline::{SkipReason, Transform, Verdict};
use crate::record::{Filter, Record, RecordId};
use crate::store::RecordSource;

/// Moves a user's avatar attachment id from one plugin's meta key to another's.
pub struct AvatarMetaMove<S> {
    attachments: S,
    from_key: String,
    to_key: String,
    keep_source: bool,
}

impl<S: RecordSource> AvatarMetaMove<S> {
    pub fn new(attachments: S, from_key: &str, to_key: &str, keep_source: bool) -> Result<Self> {
        let from_key = from_key.trim();
        let to_key = to_key.trim();
        if from_key.is_empty() || to_key.is_empty() {
            return Err(configuration("--from-key and --to-key are required"));
        }
        if from_key == to_key {
            return Err(configuration("--from-key and --to-key must differ"));
        }
        Ok(Self {
            attachments,
            from_key: from_key.to_string(),
            to_key: to_key.to_string(),
            keep_source,
        })
    }

    pub fn filter(&self) -> Filter {
        Filter::users().with_meta(self.from_key.clone())
    }

    fn attachment_exists(&self, id: RecordId) -> Result<bool> {
        let found = self
            .attachments
            .find(&Filter::posts().record_type("attachment").ids(&[id]))?;
        Ok(!found.is_empty())
    }
}

impl<S: RecordSource> Transform for AvatarMetaMove<S> {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        let Some(value) = record
            .state
            .meta_value(&self.from_key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return Ok(Verdict::Skip(SkipReason::not_found(format!(
                "`{}` is empty",
                self.from_key
            ))));
        };

        match record.state.meta_value(&self.to_key).map(str::trim) {
            Some(existing) if existing == value => {
                return Ok(Verdict::Apply(record.state.clone()));
            }
            Some(existing) if !existing.is_empty() => {
                return Ok(Verdict::Skip(SkipReason::ambiguous(format!(
                    "`{}` already holds {existing}, source holds {value}",
                    self.to_key
                ))));
            }
            _ => {}
        }

        let Ok(attachment) = value.parse::<RecordId>() else {
            return Ok(Verdict::Skip(SkipReason::not_found(format!(
                "`{}` value {value:?} is not an attachment id",
                self.from_key
            ))));
        };
        if !self.attachment_exists(attachment)? {
            return Ok(Verdict::Skip(SkipReason::not_found(format!(
                "attachment {attachment} does not exist"
            ))));
        }

        let mut state = record.state.clone();
        state.set_meta(&self.to_key, attachment.to_string());
        if !self.keep_source {
            state.meta.remove(&self.from_key);
        }
        Ok(Verdict::Apply(state))
    }
}
