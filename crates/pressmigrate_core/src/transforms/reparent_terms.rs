use std::collections::BTreeMap;

use anyhow::Result;
use tracing::warn;

use crate::error::configuration;
use crate::pipeline::{SkipReason, Transform, Verdict};
use crate::record::{Filter, Record, RecordId};
use crate::store::RecordSource;

pub const CHILD_COLUMN: &str = "child";
pub const PARENT_COLUMN: &str = "parent";

/// Child slug → parent slug assignments for one taxonomy, resolved against the store.
#[derive(Debug, Clone)]
pub struct ReparentPlan {
    taxonomy: String,
    parents: BTreeMap<String, String>,
    ids_by_slug: BTreeMap<String, Vec<RecordId>>,
    child_ids: Vec<RecordId>,
    unknown_children: Vec<String>,
}

impl ReparentPlan {
    /// Builds the plan from `child,parent` rows. An empty parent means top level.
    pub fn build<S: RecordSource + ?Sized>(
        rows: &[Record],
        taxonomy: &str,
        terms: &S,
    ) -> Result<Self> {
        let taxonomy = taxonomy.trim();
        if taxonomy.is_empty() {
            return Err(configuration("--taxonomy cannot be empty"));
        }

        let mut parents = BTreeMap::new();
        for row in rows {
            let child = row.state.field(CHILD_COLUMN).unwrap_or_default().trim();
            let parent = row.state.field(PARENT_COLUMN).unwrap_or_default().trim();
            if child.is_empty() {
                return Err(configuration(format!("row {} has an empty child slug", row.id)));
            }
            if let Some(previous) = parents.insert(child.to_string(), parent.to_string())
                && previous != parent
            {
                return Err(configuration(format!(
                    "child {child:?} is listed with parents {previous:?} and {parent:?}"
                )));
            }
        }

        let mut ids_by_slug: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
        for term in terms.find(&Filter::terms().record_type(taxonomy))? {
            if let Some(slug) = term.state.field("slug") {
                ids_by_slug.entry(slug.to_string()).or_default().push(term.id);
            }
        }

        let mut child_ids = Vec::new();
        let mut unknown_children = Vec::new();
        for child in parents.keys() {
            match ids_by_slug.get(child) {
                Some(ids) => child_ids.extend(ids.iter().copied()),
                None => {
                    warn!(taxonomy, child = %child, "listed term does not exist");
                    unknown_children.push(child.clone());
                }
            }
        }
        child_ids.sort_unstable();

        Ok(Self {
            taxonomy: taxonomy.to_string(),
            parents,
            ids_by_slug,
            child_ids,
            unknown_children,
        })
    }

    /// Filter over the listed children, or `None` when none of them exist.
    pub fn filter(&self) -> Option<Filter> {
        if self.child_ids.is_empty() {
            return None;
        }
        Some(
            Filter::terms()
                .record_type(self.taxonomy.clone())
                .ids(&self.child_ids),
        )
    }

    pub fn unknown_children(&self) -> &[String] {
        &self.unknown_children
    }
}

pub struct ReparentTerms {
    plan: ReparentPlan,
}

impl ReparentTerms {
    pub fn new(plan: ReparentPlan) -> Self {
        Self { plan }
    }
}

impl Transform for ReparentTerms {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        let slug = record.state.field("slug").unwrap_or_default();
        let Some(parent_slug) = self.plan.parents.get(slug) else {
            return Ok(Verdict::Skip(SkipReason::not_found(format!(
                "term {slug:?} is not listed"
            ))));
        };

        let parent_id = if parent_slug.is_empty() {
            0
        } else if parent_slug == slug {
            return Ok(Verdict::Skip(SkipReason::ambiguous(format!(
                "term {slug:?} is listed as its own parent"
            ))));
        } else {
            match self.plan.ids_by_slug.get(parent_slug).map(Vec::as_slice) {
                None | Some([]) => {
                    return Ok(Verdict::Skip(SkipReason::not_found(format!(
                        "parent term {parent_slug:?} does not exist in {}",
                        self.plan.taxonomy
                    ))));
                }
                Some([id]) => *id,
                Some(several) => {
                    return Ok(Verdict::Skip(SkipReason::ambiguous(format!(
                        "parent slug {parent_slug:?} matches {} terms",
                        several.len()
                    ))));
                }
            }
        };

        let mut state = record.state.clone();
        state.set_field("parent", parent_id.to_string());
        Ok(Verdict::Apply(state))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{ReparentPlan, ReparentTerms};
    use crate::delimited::{Delimiter, parse_delimited};
    use crate::error::{ErrorKind, as_configuration};
    use crate::pipeline::{Transform, Verdict, WriterPersister};
    use crate::record::{Record, RecordKind, RecordState};
    use crate::store::{MemorySource, NewTerm, RecordSource};
    use crate::transforms::test_support::{migrated_store, run_live};

    fn term(id: i64, slug: &str, parent: i64) -> Record {
        let mut state = RecordState::default();
        state.set_field("name", slug);
        state.set_field("slug", slug);
        state.set_field("taxonomy", "category");
        state.set_field("parent", parent.to_string());
        Record::new(id, RecordKind::Term, state)
    }

    fn terms() -> MemorySource {
        MemorySource::new(vec![
            term(1, "news", 0),
            term(2, "local", 0),
            term(3, "sports", 0),
            term(4, "high-school", 0),
        ])
    }

    fn plan(csv: &str) -> ReparentPlan {
        let rows = parse_delimited(csv, Delimiter::Comma).expect("rows");
        ReparentPlan::build(&rows, "category", &terms()).expect("plan")
    }

    fn verdicts(plan: ReparentPlan) -> Vec<(i64, Verdict)> {
        let source = terms();
        let filter = plan.filter().expect("filter");
        let mut transform = ReparentTerms::new(plan);
        source
            .find(&filter)
            .expect("find")
            .iter()
            .map(|record| (record.id, transform.apply(record).expect("apply")))
            .collect()
    }

    #[test]
    fn only_listed_children_are_selected_and_reparented() {
        let plan = plan("child,parent\nlocal,news\nhigh-school,sports\nghost,news\n");
        assert_eq!(plan.unknown_children(), ["ghost".to_string()]);
        let results = verdicts(plan);
        assert_eq!(results.len(), 2);
        let Verdict::Apply(local) = &results[0].1 else {
            panic!("expected apply");
        };
        assert_eq!(results[0].0, 2);
        assert_eq!(local.field("parent"), Some("1"));
        let Verdict::Apply(school) = &results[1].1 else {
            panic!("expected apply");
        };
        assert_eq!(school.field("parent"), Some("3"));
    }

    #[test]
    fn missing_parent_and_self_parent_are_skipped() {
        let results = verdicts(plan("child,parent\nlocal,metro\nsports,sports\nnews,\n"));
        let kinds = results
            .iter()
            .map(|(id, verdict)| match verdict {
                Verdict::Skip(reason) => (*id, Some(reason.kind())),
                Verdict::Apply(state) => {
                    assert_eq!(state.field("parent"), Some("0"));
                    (*id, None)
                }
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                (1, None),
                (2, Some(ErrorKind::NotFound)),
                (3, Some(ErrorKind::Ambiguous)),
            ]
        );
    }

    #[test]
    fn no_known_children_means_no_filter() {
        assert!(plan("child,parent\nghost,news\n").filter().is_none());
    }

    #[test]
    fn conflicting_rows_are_configuration_errors() {
        let rows = parse_delimited("child,parent\nlocal,news\nlocal,sports\n", Delimiter::Comma)
            .expect("rows");
        let error = ReparentPlan::build(&rows, "category", &terms()).expect_err("conflict");
        assert!(as_configuration(&error).is_some());
    }

    #[test]
    fn stored_parent_round_trips_and_reruns_unchanged() {
        let temp = tempdir().expect("tempdir");
        let store = migrated_store(temp.path());
        let category = |name: &str| NewTerm {
            slug: Some(name.to_lowercase()),
            ..NewTerm::category(name)
        };
        let news = store.insert_term(&category("News")).expect("news");
        let local = store.insert_term(&category("Local")).expect("local");

        let rows = parse_delimited("child,parent\nlocal,news\n", Delimiter::Comma).expect("rows");
        let plan = ReparentPlan::build(&rows, "category", &store).expect("plan");
        let filter = plan.filter().expect("filter");
        let mut transform = ReparentTerms::new(plan);
        let first = run_live(&store, &filter, &mut transform, &mut WriterPersister(&store));
        let second = run_live(&store, &filter, &mut transform, &mut WriterPersister(&store));
        assert_eq!(first.updated, 1);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 1);

        let stored = store.get(RecordKind::Term, local).expect("get").expect("term");
        let expected = news.to_string();
        assert_eq!(stored.state.field("parent"), Some(expected.as_str()));
        assert_eq!(stored.state.field("name"), Some("Local"));
        assert_eq!(stored.state.field("slug"), Some("local"));
    }
}
