use anyhow::Result;
use tracing::info;

use crate::error::configuration;
use crate::pipeline::{Transform, Verdict};
use crate::record::{Filter, Record};
use crate::store::Taxonomy;

pub const TARGET_POST_TYPE: &str = "post";
pub const CONVERTED_FROM_META: &str = "_converted_from_type";

/// How the target category was settled before the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryResolution {
    Existing(i64),
    Created(i64),
    /// Missing, and would be created by a live run.
    Pending,
}

/// Settles the target category up front so every record sees the same answer.
pub fn resolve_category<T: Taxonomy + ?Sized>(
    taxonomy: &T,
    name: &str,
    create: bool,
    dry_run: bool,
) -> Result<CategoryResolution> {
    let name = name.trim();
    if name.is_empty() {
        return Err(configuration("category name cannot be empty"));
    }
    let found = taxonomy.find_categories(name)?;
    match found.as_slice() {
        [id] => Ok(CategoryResolution::Existing(*id)),
        [] if !create => Err(configuration(format!(
            "category {name:?} does not exist (pass --create-category to create it)"
        ))),
        [] if dry_run => Ok(CategoryResolution::Pending),
        [] => {
            let id = taxonomy.create_category(name)?;
            info!(category = name, id, "created category");
            Ok(CategoryResolution::Created(id))
        }
        several => Err(configuration(format!(
            "category name {name:?} matches {} categories",
            several.len()
        ))),
    }
}

/// Converts posts of a custom type into regular posts filed under a category.
pub struct PostTypeToCategory {
    from_type: String,
    category: String,
}

impl PostTypeToCategory {
    pub fn new(from_type: &str, category: &str) -> Result<Self> {
        let from_type = from_type.trim();
        if from_type.is_empty() {
            return Err(configuration("--from-type cannot be empty"));
        }
        if from_type == TARGET_POST_TYPE {
            return Err(configuration(format!(
                "--from-type {from_type:?} is already the target type"
            )));
        }
        Ok(Self {
            from_type: from_type.to_string(),
            category: category.trim().to_string(),
        })
    }

    pub fn filter(&self) -> Filter {
        Filter::posts().record_type(self.from_type.clone())
    }
}

impl Transform for PostTypeToCategory {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        let mut state = record.state.clone();
        state.set_field("post_type", TARGET_POST_TYPE);
        let already_filed = state
            .categories
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&self.category));
        if !already_filed {
            state.categories.insert(self.category.clone());
        }
        if state.meta_value(CONVERTED_FROM_META).is_none() {
            state.set_meta(CONVERTED_FROM_META, self.from_type.clone());
        }
        Ok(Verdict::Apply(state))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use anyhow::Result;
    use tempfile::tempdir;

    use super::{CONVERTED_FROM_META, CategoryResolution, PostTypeToCategory, resolve_category};
    use crate::error::as_configuration;
    use crate::pipeline::{Transform, Verdict, WriterPersister};
    use crate::record::{Record, RecordKind, RecordState};
    use crate::store::{NewPost, Taxonomy};
    use crate::transforms::test_support::{migrated_store, run_live};

    #[derive(Default)]
    struct FakeTaxonomy {
        categories: RefCell<Vec<(i64, String)>>,
    }

    impl Taxonomy for FakeTaxonomy {
        fn find_categories(&self, name: &str) -> Result<Vec<i64>> {
            Ok(self
                .categories
                .borrow()
                .iter()
                .filter(|(_, existing)| existing.eq_ignore_ascii_case(name))
                .map(|(id, _)| *id)
                .collect())
        }

        fn create_category(&self, name: &str) -> Result<i64> {
            let mut categories = self.categories.borrow_mut();
            let id = categories.len() as i64 + 100;
            categories.push((id, name.to_string()));
            Ok(id)
        }
    }

    #[test]
    fn missing_category_is_fatal_without_create_flag() {
        let taxonomy = FakeTaxonomy::default();
        let error = resolve_category(&taxonomy, "Obituaries", false, false).expect_err("missing");
        assert!(as_configuration(&error).is_some());
    }

    #[test]
    fn create_flag_creates_only_on_live_runs() {
        let taxonomy = FakeTaxonomy::default();
        assert_eq!(
            resolve_category(&taxonomy, "Obituaries", true, true).expect("dry"),
            CategoryResolution::Pending
        );
        assert!(taxonomy.categories.borrow().is_empty());
        assert_eq!(
            resolve_category(&taxonomy, "Obituaries", true, false).expect("live"),
            CategoryResolution::Created(100)
        );
        assert_eq!(
            resolve_category(&taxonomy, "obituaries", false, false).expect("existing"),
            CategoryResolution::Existing(100)
        );
    }

    #[test]
    fn duplicate_category_names_are_fatal() {
        let taxonomy = FakeTaxonomy::default();
        taxonomy.create_category("News").expect("create");
        taxonomy.create_category("news").expect("create");
        let error = resolve_category(&taxonomy, "NEWS", true, false).expect_err("ambiguous");
        assert!(as_configuration(&error).is_some());
    }

    #[test]
    fn converts_type_and_files_under_category_once() {
        let mut transform = PostTypeToCategory::new("obituary", "Obituaries").expect("new");
        let mut state = RecordState::with_body("In memoriam");
        state.set_field("post_type", "obituary");
        let record = Record::new(3, RecordKind::Post, state);

        let Verdict::Apply(converted) = transform.apply(&record).expect("apply") else {
            panic!("expected apply");
        };
        assert_eq!(converted.field("post_type"), Some("post"));
        assert!(converted.categories.contains("Obituaries"));
        assert_eq!(converted.meta_value(CONVERTED_FROM_META), Some("obituary"));

        let again = Record::new(3, RecordKind::Post, converted.clone());
        assert_eq!(
            transform.apply(&again).expect("apply"),
            Verdict::Apply(converted)
        );
    }

    #[test]
    fn existing_category_with_other_casing_is_kept() {
        let mut transform = PostTypeToCategory::new("obituary", "obituaries").expect("new");
        let mut state = RecordState::default();
        state.set_field("post_type", "obituary");
        state.categories.insert("Obituaries".to_string());
        let record = Record::new(4, RecordKind::Post, state);
        let Verdict::Apply(converted) = transform.apply(&record).expect("apply") else {
            panic!("expected apply");
        };
        assert_eq!(converted.categories.len(), 1);
    }

    #[test]
    fn target_type_cannot_be_source() {
        assert!(PostTypeToCategory::new("post", "News").is_err());
        assert!(PostTypeToCategory::new(" ", "News").is_err());
    }

    #[test]
    fn stored_conversion_round_trips_and_reruns_unchanged() {
        let temp = tempdir().expect("tempdir");
        let store = migrated_store(temp.path());
        let id = store
            .insert_post(&NewPost {
                post_type: "obituary".to_string(),
                content: "In memoriam".to_string(),
                meta: vec![("_edit_last".to_string(), "3".to_string())],
                ..NewPost::default()
            })
            .expect("post");
        assert!(matches!(
            resolve_category(&store, "Obituaries", true, false).expect("category"),
            CategoryResolution::Created(_)
        ));

        let mut transform = PostTypeToCategory::new("obituary", "Obituaries").expect("new");
        let filter = transform.filter();
        let first = run_live(&store, &filter, &mut transform, &mut WriterPersister(&store));
        let second = run_live(&store, &filter, &mut transform, &mut WriterPersister(&store));
        assert_eq!(first.updated, 1);
        assert_eq!(second.updated, 0);

        let stored = store.get(RecordKind::Post, id).expect("get").expect("post");
        assert_eq!(stored.state.field("post_type"), Some("post"));
        assert!(stored.state.categories.contains("Obituaries"));
        assert_eq!(stored.state.meta_value(CONVERTED_FROM_META), Some("obituary"));
        assert_eq!(stored.state.meta_value("_edit_last"), Some("3"));
        assert_eq!(
            transform.apply(&stored).expect("apply"),
            Verdict::Apply(stored.state.clone())
        );
    }
}
