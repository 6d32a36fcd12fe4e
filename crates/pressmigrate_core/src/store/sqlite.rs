use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use super::schema::{SchemaReport, apply_schema, pending_count};
use super::{RecordSource, RecordWriter, Taxonomy};
use crate::error::configuration;
use crate::record::{Filter, Record, RecordId, RecordKind, RecordState};

const CATEGORY_TAXONOMY: &str = "category";

#[derive(Debug, Clone)]
pub struct NewPost {
    pub post_type: String,
    pub post_status: String,
    pub title: String,
    pub name: String,
    pub content: String,
    pub parent: RecordId,
    pub author: RecordId,
    pub guid: String,
    pub meta: Vec<(String, String)>,
}

impl Default for NewPost {
    fn default() -> Self {
        Self {
            post_type: "post".to_string(),
            post_status: "publish".to_string(),
            title: String::new(),
            name: String::new(),
            content: String::new(),
            parent: 0,
            author: 0,
            guid: String::new(),
            meta: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub login: String,
    pub display_name: String,
    pub email: String,
    pub meta: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct NewTerm {
    pub name: String,
    pub slug: Option<String>,
    pub taxonomy: String,
    pub parent: RecordId,
}

impl NewTerm {
    pub fn category(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slug: None,
            taxonomy: CATEGORY_TAXONOMY.to_string(),
            parent: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub posts: usize,
    pub posts_by_type: BTreeMap<String, usize>,
    pub post_meta_rows: usize,
    pub users: usize,
    pub terms: usize,
    pub schema_version: u32,
}

/// Handle on one site's content database.
pub struct SqliteStore {
    connection: Connection,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database parent directory {}", parent.display())
            })?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys pragma")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing database and refuses to run against an outdated schema.
    pub fn open_ready(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(configuration(format!(
                "data store not found at {} (run `pressmigrate db migrate` first)",
                path.display()
            )));
        }
        let store = Self::open(path)?;
        let pending = store.pending_migrations()?;
        if pending > 0 {
            return Err(configuration(format!(
                "{} has {pending} pending schema migration(s); run `pressmigrate db migrate`",
                path.display()
            )));
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn migrate(&self) -> Result<SchemaReport> {
        apply_schema(&self.connection)
    }

    pub fn pending_migrations(&self) -> Result<usize> {
        pending_count(&self.connection)
    }

    pub fn insert_post(&self, post: &NewPost) -> Result<RecordId> {
        self.with_savepoint("insert_post", || {
            self.connection
                .execute(
                    "INSERT INTO posts (
                        post_type, post_status, post_title, post_name, post_content,
                        post_parent, post_author, guid, modified_at_unix
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        post.post_type,
                        post.post_status,
                        post.title,
                        post.name,
                        post.content,
                        post.parent,
                        post.author,
                        post.guid,
                        chrono::Utc::now().timestamp(),
                    ],
                )
                .context("failed to insert post")?;
            let id = self.connection.last_insert_rowid();
            for (key, value) in &post.meta {
                insert_meta(&self.connection, "post_meta", "post_id", id, key, value)?;
            }
            Ok(id)
        })
    }

    pub fn insert_user(&self, user: &NewUser) -> Result<RecordId> {
        self.with_savepoint("insert_user", || {
            self.connection
                .execute(
                    "INSERT INTO users (user_login, display_name, user_email) VALUES (?1, ?2, ?3)",
                    params![user.login, user.display_name, user.email],
                )
                .with_context(|| format!("failed to insert user {}", user.login))?;
            let id = self.connection.last_insert_rowid();
            for (key, value) in &user.meta {
                insert_meta(&self.connection, "user_meta", "user_id", id, key, value)?;
            }
            Ok(id)
        })
    }

    pub fn insert_term(&self, term: &NewTerm) -> Result<RecordId> {
        let slug = term
            .slug
            .clone()
            .unwrap_or_else(|| slugify(&term.name));
        if slug.is_empty() {
            bail!("term {:?} has an empty slug", term.name);
        }
        self.connection
            .execute(
                "INSERT INTO terms (name, slug, taxonomy, parent) VALUES (?1, ?2, ?3, ?4)",
                params![term.name, slug, term.taxonomy, term.parent],
            )
            .with_context(|| format!("failed to insert {} term {}", term.taxonomy, term.name))?;
        Ok(self.connection.last_insert_rowid())
    }

    /// Attaches an existing category to a post without touching anything else.
    pub fn assign_category(&self, post_id: RecordId, term_id: RecordId) -> Result<()> {
        self.connection
            .execute(
                "INSERT OR IGNORE INTO term_relationships (object_id, term_id) VALUES (?1, ?2)",
                params![post_id, term_id],
            )
            .with_context(|| format!("failed to assign term {term_id} to post {post_id}"))?;
        Ok(())
    }

    pub fn get(&self, kind: RecordKind, id: RecordId) -> Result<Option<Record>> {
        Ok(self
            .find(&Filter::new(kind).ids(&[id]))?
            .into_iter()
            .next())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: &str| -> Result<usize> {
            let value: i64 = self
                .connection
                .query_row(sql, [], |row| row.get(0))
                .with_context(|| format!("failed to run count query: {sql}"))?;
            usize::try_from(value).context("count does not fit into usize")
        };

        let mut posts_by_type = BTreeMap::new();
        let mut statement = self
            .connection
            .prepare("SELECT post_type, COUNT(*) FROM posts GROUP BY post_type ORDER BY post_type")
            .context("failed to prepare post type stats query")?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("failed to run post type stats query")?;
        for row in rows {
            let (post_type, total) = row.context("failed to decode post type stats row")?;
            posts_by_type.insert(
                post_type,
                usize::try_from(total).context("count does not fit into usize")?,
            );
        }

        Ok(StoreStats {
            posts: count("SELECT COUNT(*) FROM posts")?,
            posts_by_type,
            post_meta_rows: count("SELECT COUNT(*) FROM post_meta")?,
            users: count("SELECT COUNT(*) FROM users")?,
            terms: count("SELECT COUNT(*) FROM terms")?,
            schema_version: super::schema::current_version(&self.connection)?,
        })
    }

    fn with_savepoint<T>(&self, name: &str, work: impl FnOnce() -> Result<T>) -> Result<T> {
        self.connection
            .execute_batch(&format!("SAVEPOINT {name}"))
            .context("failed to create savepoint")?;
        match work() {
            Ok(value) => {
                self.connection
                    .execute_batch(&format!("RELEASE SAVEPOINT {name}"))
                    .context("failed to release savepoint")?;
                Ok(value)
            }
            Err(err) => {
                let _ = self
                    .connection
                    .execute_batch(&format!("ROLLBACK TO SAVEPOINT {name}"));
                let _ = self
                    .connection
                    .execute_batch(&format!("RELEASE SAVEPOINT {name}"));
                Err(err)
            }
        }
    }

    fn find_posts(&self, filter: &Filter) -> Result<Vec<Record>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        push_in_clause(&mut clauses, &mut values, "post_type", &filter.record_types);
        push_in_clause(&mut clauses, &mut values, "post_status", &filter.statuses);
        push_id_clause(&mut clauses, &mut values, filter.ids.as_deref());
        let sql = format!(
            "SELECT id, post_type, post_status, post_title, post_name, post_content,
                    post_parent, post_author, guid
             FROM posts{} ORDER BY id",
            where_sql(&clauses)
        );

        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare post query")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), |row| {
                let mut state = RecordState::with_body(row.get::<_, String>(5)?);
                state.set_field("post_type", row.get::<_, String>(1)?);
                state.set_field("post_status", row.get::<_, String>(2)?);
                state.set_field("post_title", row.get::<_, String>(3)?);
                state.set_field("post_name", row.get::<_, String>(4)?);
                state.set_field("post_parent", row.get::<_, i64>(6)?.to_string());
                state.set_field("post_author", row.get::<_, i64>(7)?.to_string());
                state.set_field("guid", row.get::<_, String>(8)?);
                Ok(Record::new(row.get(0)?, RecordKind::Post, state))
            })
            .context("failed to run post query")?;

        let mut records = Vec::new();
        for row in rows {
            let mut record = row.context("failed to decode post row")?;
            record.state.meta = load_meta(&self.connection, "post_meta", "post_id", record.id)?;
            record.state.categories = self.load_categories(record.id)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn find_users(&self, filter: &Filter) -> Result<Vec<Record>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        push_id_clause(&mut clauses, &mut values, filter.ids.as_deref());
        let sql = format!(
            "SELECT id, user_login, display_name, user_email, description
             FROM users{} ORDER BY id",
            where_sql(&clauses)
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare user query")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), |row| {
                let mut state = RecordState::with_body(row.get::<_, String>(4)?);
                state.set_field("user_login", row.get::<_, String>(1)?);
                state.set_field("display_name", row.get::<_, String>(2)?);
                state.set_field("user_email", row.get::<_, String>(3)?);
                Ok(Record::new(row.get(0)?, RecordKind::User, state))
            })
            .context("failed to run user query")?;

        let mut records = Vec::new();
        for row in rows {
            let mut record = row.context("failed to decode user row")?;
            record.state.meta = load_meta(&self.connection, "user_meta", "user_id", record.id)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn find_terms(&self, filter: &Filter) -> Result<Vec<Record>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        push_in_clause(&mut clauses, &mut values, "taxonomy", &filter.record_types);
        push_id_clause(&mut clauses, &mut values, filter.ids.as_deref());
        let sql = format!(
            "SELECT id, name, slug, taxonomy, parent, description FROM terms{} ORDER BY id",
            where_sql(&clauses)
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare term query")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), |row| {
                let mut state = RecordState::with_body(row.get::<_, String>(5)?);
                state.set_field("name", row.get::<_, String>(1)?);
                state.set_field("slug", row.get::<_, String>(2)?);
                state.set_field("taxonomy", row.get::<_, String>(3)?);
                state.set_field("parent", row.get::<_, i64>(4)?.to_string());
                Ok(Record::new(row.get(0)?, RecordKind::Term, state))
            })
            .context("failed to run term query")?;

        let mut records = Vec::new();
        for row in rows {
            let record = row.context("failed to decode term row")?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn load_categories(&self, post_id: RecordId) -> Result<BTreeSet<String>> {
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT t.name FROM term_relationships r
                 JOIN terms t ON t.id = r.term_id
                 WHERE r.object_id = ?1 AND t.taxonomy = ?2",
            )
            .context("failed to prepare category query")?;
        let rows = statement
            .query_map(params![post_id, CATEGORY_TAXONOMY], |row| row.get::<_, String>(0))
            .context("failed to run category query")?;
        let mut names = BTreeSet::new();
        for row in rows {
            names.insert(row.context("failed to decode category row")?);
        }
        Ok(names)
    }

    fn write_post(&self, id: RecordId, state: &RecordState) -> Result<()> {
        reject_unknown_fields(RecordKind::Post, state)?;
        let parent = parse_optional_id(state, "post_parent")?;
        let author = parse_optional_id(state, "post_author")?;
        let changed = self
            .connection
            .execute(
                "UPDATE posts SET
                    post_content = ?1,
                    post_type = COALESCE(?2, post_type),
                    post_status = COALESCE(?3, post_status),
                    post_title = COALESCE(?4, post_title),
                    post_name = COALESCE(?5, post_name),
                    post_parent = COALESCE(?6, post_parent),
                    post_author = COALESCE(?7, post_author),
                    guid = COALESCE(?8, guid),
                    modified_at_unix = ?9
                 WHERE id = ?10",
                params![
                    state.body,
                    state.field("post_type"),
                    state.field("post_status"),
                    state.field("post_title"),
                    state.field("post_name"),
                    parent,
                    author,
                    state.field("guid"),
                    chrono::Utc::now().timestamp(),
                    id,
                ],
            )
            .with_context(|| format!("failed to update post {id}"))?;
        if changed == 0 {
            bail!("post {id} does not exist");
        }
        replace_meta(&self.connection, "post_meta", "post_id", id, &state.meta)?;
        self.replace_categories(id, &state.categories)
    }

    fn replace_categories(&self, post_id: RecordId, names: &BTreeSet<String>) -> Result<()> {
        let mut term_ids = Vec::with_capacity(names.len());
        for name in names {
            let matches = self.find_categories(name)?;
            match matches.as_slice() {
                [term_id] => term_ids.push(*term_id),
                [] => bail!("category {name:?} does not exist"),
                _ => bail!("category name {name:?} matches {} terms", matches.len()),
            }
        }
        self.connection
            .execute(
                "DELETE FROM term_relationships
                 WHERE object_id = ?1
                   AND term_id IN (SELECT id FROM terms WHERE taxonomy = ?2)",
                params![post_id, CATEGORY_TAXONOMY],
            )
            .with_context(|| format!("failed to clear categories for post {post_id}"))?;
        for term_id in term_ids {
            self.assign_category(post_id, term_id)?;
        }
        Ok(())
    }

    fn write_user(&self, id: RecordId, state: &RecordState) -> Result<()> {
        reject_unknown_fields(RecordKind::User, state)?;
        let changed = self
            .connection
            .execute(
                "UPDATE users SET
                    description = ?1,
                    user_login = COALESCE(?2, user_login),
                    display_name = COALESCE(?3, display_name),
                    user_email = COALESCE(?4, user_email)
                 WHERE id = ?5",
                params![
                    state.body,
                    state.field("user_login"),
                    state.field("display_name"),
                    state.field("user_email"),
                    id,
                ],
            )
            .with_context(|| format!("failed to update user {id}"))?;
        if changed == 0 {
            bail!("user {id} does not exist");
        }
        replace_meta(&self.connection, "user_meta", "user_id", id, &state.meta)
    }

    fn write_term(&self, id: RecordId, state: &RecordState) -> Result<()> {
        reject_unknown_fields(RecordKind::Term, state)?;
        if !state.meta.is_empty() {
            bail!("terms do not store meta");
        }
        let parent = parse_optional_id(state, "parent")?;
        if let Some(parent) = parent {
            self.check_term_parent(id, parent)?;
        }
        let changed = self
            .connection
            .execute(
                "UPDATE terms SET
                    description = ?1,
                    name = COALESCE(?2, name),
                    slug = COALESCE(?3, slug),
                    taxonomy = COALESCE(?4, taxonomy),
                    parent = COALESCE(?5, parent)
                 WHERE id = ?6",
                params![
                    state.body,
                    state.field("name"),
                    state.field("slug"),
                    state.field("taxonomy"),
                    parent,
                    id,
                ],
            )
            .with_context(|| format!("failed to update term {id}"))?;
        if changed == 0 {
            bail!("term {id} does not exist");
        }
        Ok(())
    }

    fn check_term_parent(&self, id: RecordId, parent: RecordId) -> Result<()> {
        if parent == 0 {
            return Ok(());
        }
        if parent == id {
            bail!("term {id} cannot be its own parent");
        }
        let mut seen = BTreeSet::new();
        let mut cursor = parent;
        while cursor != 0 {
            if cursor == id {
                bail!("setting parent {parent} on term {id} would create a cycle");
            }
            if !seen.insert(cursor) {
                bail!("term hierarchy above {parent} already contains a cycle");
            }
            cursor = self
                .connection
                .query_row("SELECT parent FROM terms WHERE id = ?1", [cursor], |row| {
                    row.get(0)
                })
                .optional()
                .with_context(|| format!("failed to read parent of term {cursor}"))?
                .ok_or_else(|| anyhow::anyhow!("parent term {cursor} does not exist"))?;
        }
        Ok(())
    }
}

impl RecordSource for SqliteStore {
    fn find(&self, filter: &Filter) -> Result<Vec<Record>> {
        filter.validate()?;
        match filter.kind {
            RecordKind::Post => self.find_posts(filter),
            RecordKind::User => self.find_users(filter),
            RecordKind::Term => self.find_terms(filter),
            RecordKind::Row => Err(configuration(
                "row records come from input files, not the data store",
            )),
        }
    }
}

impl RecordWriter for SqliteStore {
    fn write(&self, record: &Record, state: &RecordState) -> Result<()> {
        match record.kind {
            RecordKind::Post => {
                self.with_savepoint("write_post", || self.write_post(record.id, state))
            }
            RecordKind::User => {
                self.with_savepoint("write_user", || self.write_user(record.id, state))
            }
            RecordKind::Term => {
                self.with_savepoint("write_term", || self.write_term(record.id, state))
            }
            RecordKind::Row => bail!("row records cannot be written to the data store"),
        }
    }

    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.with_savepoint("atomic_write", || work())
    }
}

impl Taxonomy for SqliteStore {
    fn find_categories(&self, name: &str) -> Result<Vec<RecordId>> {
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT id FROM terms WHERE taxonomy = ?1 AND lower(name) = lower(?2) ORDER BY id",
            )
            .context("failed to prepare category lookup")?;
        let rows = statement
            .query_map(params![CATEGORY_TAXONOMY, name.trim()], |row| row.get(0))
            .context("failed to run category lookup")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("failed to decode category id")?);
        }
        Ok(ids)
    }

    fn create_category(&self, name: &str) -> Result<RecordId> {
        let name = name.trim();
        if name.is_empty() {
            bail!("category name cannot be empty");
        }
        self.insert_term(&NewTerm::category(name))
    }
}

/// Lowercase ASCII slug with single dashes, the way permalinks are built.
pub fn slugify(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_dash = true;
    for ch in value.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                output.push(lower);
            }
            previous_dash = false;
        } else if !previous_dash {
            output.push('-');
            previous_dash = true;
        }
    }
    while output.ends_with('-') {
        output.pop();
    }
    output
}

fn reject_unknown_fields(kind: RecordKind, state: &RecordState) -> Result<()> {
    let known = kind.known_fields();
    if let Some(unknown) = state
        .fields
        .keys()
        .find(|key| !known.contains(&key.as_str()))
    {
        bail!("{kind} records have no field `{unknown}`");
    }
    Ok(())
}

fn parse_optional_id(state: &RecordState, key: &str) -> Result<Option<RecordId>> {
    state
        .field(key)
        .map(|value| {
            value
                .trim()
                .parse::<RecordId>()
                .with_context(|| format!("field `{key}` must be an integer id, got {value:?}"))
        })
        .transpose()
}

fn push_in_clause(
    clauses: &mut Vec<String>,
    values: &mut Vec<SqlValue>,
    column: &str,
    wanted: &[String],
) {
    if wanted.is_empty() {
        return;
    }
    let placeholders = vec!["?"; wanted.len()].join(", ");
    clauses.push(format!("{column} IN ({placeholders})"));
    values.extend(wanted.iter().cloned().map(SqlValue::Text));
}

fn push_id_clause(
    clauses: &mut Vec<String>,
    values: &mut Vec<SqlValue>,
    ids: Option<&[RecordId]>,
) {
    let Some(ids) = ids else {
        return;
    };
    if ids.is_empty() {
        clauses.push("0 = 1".to_string());
        return;
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    clauses.push(format!("id IN ({placeholders})"));
    values.extend(ids.iter().copied().map(SqlValue::Integer));
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn load_meta(
    connection: &Connection,
    table: &str,
    owner_column: &str,
    owner: RecordId,
) -> Result<BTreeMap<String, String>> {
    let sql = format!("SELECT meta_key, meta_value FROM {table} WHERE {owner_column} = ?1");
    let mut statement = connection
        .prepare_cached(&sql)
        .with_context(|| format!("failed to prepare {table} query"))?;
    let rows = statement
        .query_map([owner], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .with_context(|| format!("failed to run {table} query"))?;
    let mut meta = BTreeMap::new();
    for row in rows {
        let (key, value) = row.with_context(|| format!("failed to decode {table} row"))?;
        meta.insert(key, value);
    }
    Ok(meta)
}

fn insert_meta(
    connection: &Connection,
    table: &str,
    owner_column: &str,
    owner: RecordId,
    key: &str,
    value: &str,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table} ({owner_column}, meta_key, meta_value) VALUES (?1, ?2, ?3)
         ON CONFLICT({owner_column}, meta_key) DO UPDATE SET meta_value = excluded.meta_value"
    );
    connection
        .execute(&sql, params![owner, key, value])
        .with_context(|| format!("failed to write {table} {key} for {owner}"))?;
    Ok(())
}

fn replace_meta(
    connection: &Connection,
    table: &str,
    owner_column: &str,
    owner: RecordId,
    meta: &BTreeMap<String, String>,
) -> Result<()> {
    connection
        .execute(
            &format!("DELETE FROM {table} WHERE {owner_column} = ?1"),
            [owner],
        )
        .with_context(|| format!("failed to clear {table} for {owner}"))?;
    for (key, value) in meta {
        insert_meta(connection, table, owner_column, owner, key, value)?;
    }
    Ok(())
}
