//! The batch record transformer: fetch, transform, detect no-ops, persist, log.
//!
//! Every record returned by the source produces exactly one [`Outcome`]. Only a
//! configuration error (bad filter, unreadable input) stops a run, and it does so
//! before the first record is touched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::Result;
use similar::TextDiff;
use tracing::info;

use crate::error::{ErrorKind, MigrationError};
use crate::outcome_log::OutcomeLog;
use crate::record::{Filter, Record, RecordId, RecordState, short_hash};
use crate::store::{RecordSource, RecordWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Live,
    DryRun,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::DryRun => "dry-run",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Print a unified diff of every changed body to stdout.
    pub show_diff: bool,
}

impl RunOptions {
    pub fn mode(&self) -> RunMode {
        if self.dry_run {
            RunMode::DryRun
        } else {
            RunMode::Live
        }
    }
}

/// Why a transform declined to produce a new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipReason(MigrationError);

impl SkipReason {
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self(MigrationError::NotFound(detail.into()))
    }

    pub fn ambiguous(detail: impl Into<String>) -> Self {
        Self(MigrationError::Ambiguous(detail.into()))
    }

    pub fn external(detail: impl Into<String>) -> Self {
        Self(MigrationError::ExternalFetchFailure(detail.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }

    pub fn detail(&self) -> &str {
        self.0.detail()
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind().as_str(), self.detail())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Apply(RecordState),
    Skip(SkipReason),
}

/// Maps one record's current state to its desired state.
///
/// Implementations may look things up but must not write anything; writes belong
/// to the [`Persister`] so that dry runs stay side-effect free.
pub trait Transform {
    fn apply(&mut self, record: &Record) -> Result<Verdict>;
}

pub trait Persister {
    fn persist(&mut self, record: &Record, state: &RecordState) -> Result<()>;
}

/// Persists through a [`RecordWriter`], one atomic write per record.
pub struct WriterPersister<W>(pub W);

impl<W: RecordWriter> Persister for WriterPersister<W> {
    fn persist(&mut self, record: &Record, state: &RecordState) -> Result<()> {
        self.0.write(record, state)
    }
}

impl<P: Persister + ?Sized> Persister for &mut P {
    fn persist(&mut self, record: &Record, state: &RecordState) -> Result<()> {
        (**self).persist(record, state)
    }
}

impl<T: Transform + ?Sized> Transform for &mut T {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        (**self).apply(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Unchanged,
    Updated,
    Skipped,
    Error,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub record_id: RecordId,
    pub label: String,
    pub kind: OutcomeKind,
    pub reason: String,
    pub error_kind: Option<ErrorKind>,
}

impl Outcome {
    fn new(record: &Record, kind: OutcomeKind, reason: String) -> Self {
        Self {
            record_id: record.id,
            label: record.label(),
            kind,
            reason,
            error_kind: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub unchanged: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errored: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.unchanged + self.updated + self.skipped + self.errored
    }

    pub fn render(&self) -> String {
        format!(
            "processed={} updated={} unchanged={} skipped={} errored={} elapsed={:.3}s",
            self.processed(),
            self.updated,
            self.unchanged,
            self.skipped,
            self.errored,
            self.elapsed.as_secs_f64()
        )
    }

    fn count(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Unchanged => self.unchanged += 1,
            OutcomeKind::Updated => self.updated += 1,
            OutcomeKind::Skipped => self.skipped += 1,
            OutcomeKind::Error => self.errored += 1,
        }
    }
}

/// Runs one batch. Returns `Err` only for failures that abort the whole run.
pub fn run_batch<S, T, P, W>(
    source: &S,
    filter: &Filter,
    transform: &mut T,
    persister: &mut P,
    log: &mut OutcomeLog<W>,
    options: RunOptions,
) -> Result<RunSummary>
where
    S: RecordSource + ?Sized,
    T: Transform + ?Sized,
    P: Persister + ?Sized,
    W: Write,
{
    let started = Instant::now();
    let records = source.find(filter)?;
    let mode = options.mode();
    log.start(mode, records.len())?;

    let mut summary = RunSummary::default();
    for record in &records {
        let outcome = process_record(record, transform, persister, options);
        summary.count(outcome.kind);
        log.record(&outcome)?;
    }
    summary.elapsed = started.elapsed();
    log.finish(&summary)?;
    info!(mode = mode.as_str(), "{}", summary.render());
    Ok(summary)
}

fn process_record<T, P>(
    record: &Record,
    transform: &mut T,
    persister: &mut P,
    options: RunOptions,
) -> Outcome
where
    T: Transform + ?Sized,
    P: Persister + ?Sized,
{
    let new_state = match transform.apply(record) {
        Ok(Verdict::Apply(state)) => state,
        Ok(Verdict::Skip(reason)) => {
            let mut outcome = Outcome::new(record, OutcomeKind::Skipped, reason.to_string());
            outcome.error_kind = Some(reason.kind());
            return outcome;
        }
        Err(error) => {
            let mut outcome = Outcome::new(record, OutcomeKind::Error, format!("{error:#}"));
            outcome.error_kind = classify(&error);
            return outcome;
        }
    };

    if new_state == record.state {
        return Outcome::new(record, OutcomeKind::Unchanged, String::new());
    }

    let description = describe_changes(&record.state, &new_state);
    if options.show_diff && new_state.body != record.state.body {
        print!("{}", body_diff(&record.label(), &record.state.body, &new_state.body));
    }
    if !options.dry_run
        && let Err(error) = persister.persist(record, &new_state)
    {
        let mut outcome = Outcome::new(
            record,
            OutcomeKind::Error,
            format!("{}: {error:#}", ErrorKind::PersistenceFailure.as_str()),
        );
        outcome.error_kind = Some(classify(&error).unwrap_or(ErrorKind::PersistenceFailure));
        return outcome;
    }
    Outcome::new(record, OutcomeKind::Updated, description)
}

fn classify(error: &anyhow::Error) -> Option<ErrorKind> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<MigrationError>())
        .map(MigrationError::kind)
}

/// Compact list of what differs between two states, for the log line.
pub fn describe_changes(old: &RecordState, new: &RecordState) -> String {
    let mut parts = Vec::new();
    if old.body != new.body {
        parts.push(format!(
            "body {}->{}",
            short_hash(old.body.as_bytes()),
            short_hash(new.body.as_bytes())
        ));
    }
    describe_map("field", &old.fields, &new.fields, &mut parts);
    describe_map("meta", &old.meta, &new.meta, &mut parts);
    describe_set("category", &old.categories, &new.categories, &mut parts);
    parts.join(", ")
}

fn describe_map(
    label: &str,
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
    parts: &mut Vec<String>,
) {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        match (old.get(key), new.get(key)) {
            (None, Some(_)) => parts.push(format!("{label} +{key}")),
            (Some(_), None) => parts.push(format!("{label} -{key}")),
            (Some(before), Some(after)) if before != after => {
                parts.push(format!("{label} ~{key}"));
            }
            _ => {}
        }
    }
}

fn describe_set(
    label: &str,
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
    parts: &mut Vec<String>,
) {
    for added in new.difference(old) {
        parts.push(format!("{label} +{added}"));
    }
    for removed in old.difference(new) {
        parts.push(format!("{label} -{removed}"));
    }
}

pub fn body_diff(label: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(2)
        .header(&format!("{label} (before)"), &format!("{label} (after)"))
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use anyhow::{Result, bail};

    use super::{
        Persister, RunOptions, SkipReason, Transform, Verdict, WriterPersister, body_diff,
        describe_changes, run_batch,
    };
    use crate::error::{ErrorKind, as_configuration};
    use crate::outcome_log::{OutcomeLog, strip_timestamps};
    use crate::record::{Filter, Record, RecordKind, RecordState};
    use crate::store::{MemorySource, RecordWriter};

    /// Uppercases bodies; skips empty ones; fails on "boom".
    struct Shout;

    impl Transform for Shout {
        fn apply(&mut self, record: &Record) -> Result<Verdict> {
            if record.state.body.is_empty() {
                return Ok(Verdict::Skip(SkipReason::not_found("empty body")));
            }
            if record.state.body == "boom" {
                bail!("transform exploded");
            }
            let mut state = record.state.clone();
            state.body = state.body.to_uppercase();
            Ok(Verdict::Apply(state))
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        writes: RefCell<Vec<(i64, String)>>,
        fail_on: Option<i64>,
    }

    impl RecordWriter for RecordingWriter {
        fn write(&self, record: &Record, state: &RecordState) -> Result<()> {
            if self.fail_on == Some(record.id) {
                bail!("database is locked");
            }
            self.writes.borrow_mut().push((record.id, state.body.clone()));
            Ok(())
        }
    }

    fn posts(bodies: &[&str]) -> MemorySource {
        MemorySource::new(
            bodies
                .iter()
                .enumerate()
                .map(|(index, body)| {
                    Record::new(index as i64 + 1, RecordKind::Post, RecordState::with_body(*body))
                })
                .collect(),
        )
    }

    fn run(
        source: &MemorySource,
        writer: &RecordingWriter,
        options: RunOptions,
    ) -> (super::RunSummary, Vec<String>) {
        let mut log = OutcomeLog::with_sink("shout", Vec::new());
        let summary = run_batch(
            source,
            &Filter::posts(),
            &mut Shout,
            &mut WriterPersister(writer),
            &mut log,
            options,
        )
        .expect("run");
        let content = String::from_utf8(log.into_sink()).expect("utf8");
        (summary, strip_timestamps(&content))
    }

    #[test]
    fn unchanged_records_never_reach_the_persister() {
        let source = posts(&["LOUD", "quiet"]);
        let writer = RecordingWriter::default();
        let (summary, _) = run(&source, &writer, RunOptions::default());
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(*writer.writes.borrow(), vec![(2, "QUIET".to_string())]);
    }

    #[test]
    fn every_record_gets_exactly_one_outcome() {
        let source = posts(&["a", "", "boom", "B"]);
        let writer = RecordingWriter::default();
        let (summary, lines) = run(&source, &writer, RunOptions::default());
        assert_eq!(summary.processed(), 4);
        assert_eq!(
            (summary.updated, summary.skipped, summary.errored, summary.unchanged),
            (1, 1, 1, 1)
        );
        assert_eq!(lines.len(), 6);
        assert!(lines[2].contains("skipped (not_found: empty body)"));
        assert!(lines[3].contains("error (transform exploded)"));
    }

    #[test]
    fn persistence_failure_is_counted_and_run_continues() {
        let source = posts(&["a", "b", "c"]);
        let writer = RecordingWriter {
            fail_on: Some(2),
            ..RecordingWriter::default()
        };
        let (summary, lines) = run(&source, &writer, RunOptions::default());
        assert_eq!(summary.processed(), 3);
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.errored, 1);
        assert!(lines[2].contains("persistence_failure: database is locked"));
        assert_eq!(writer.writes.borrow().len(), 2);
    }

    #[test]
    fn dry_run_classifies_and_logs_identically() {
        let source = posts(&["a", "B", ""]);
        let live_writer = RecordingWriter::default();
        let dry_writer = RecordingWriter::default();
        let (live, live_lines) = run(&source, &live_writer, RunOptions::default());
        let (dry, dry_lines) = run(
            &source,
            &dry_writer,
            RunOptions {
                dry_run: true,
                ..RunOptions::default()
            },
        );
        assert!(dry_writer.writes.borrow().is_empty());
        assert_eq!(
            (live.updated, live.unchanged, live.skipped),
            (dry.updated, dry.unchanged, dry.skipped)
        );
        assert!(dry_lines[0].contains("mode=dry-run"));
        assert!(live_lines[0].contains("mode=live"));
        assert_eq!(live_lines[1..4], dry_lines[1..4]);
    }

    #[test]
    fn malformed_filter_aborts_before_processing() {
        let source = posts(&["a"]);
        let mut log = OutcomeLog::with_sink("shout", Vec::new());
        let error = run_batch(
            &source,
            &Filter::posts().field_equals("nope", "x"),
            &mut Shout,
            &mut WriterPersister(RecordingWriter::default()),
            &mut log,
            RunOptions::default(),
        )
        .expect_err("configuration");
        assert!(as_configuration(&error).is_some());
        assert!(log.into_sink().is_empty());
    }

    #[test]
    fn persister_errors_keep_their_classification() {
        struct Offline;
        impl Persister for Offline {
            fn persist(&mut self, _: &Record, _: &RecordState) -> Result<()> {
                Err(crate::error::MigrationError::ExternalFetchFailure("HTTP 503".to_string()).into())
            }
        }
        let source = posts(&["a"]);
        let mut log = OutcomeLog::with_sink("shout", Vec::new());
        let summary = run_batch(
            &source,
            &Filter::posts(),
            &mut Shout,
            &mut Offline,
            &mut log,
            RunOptions::default(),
        )
        .expect("run");
        assert_eq!(summary.errored, 1);
        let lines = strip_timestamps(&String::from_utf8(log.into_sink()).expect("utf8"));
        assert!(lines[1].contains("HTTP 503"));
        assert_eq!(ErrorKind::ExternalFetchFailure.as_str(), "external_fetch_failure");
    }

    #[test]
    fn change_description_lists_every_difference() {
        let mut old = RecordState::with_body("a");
        old.set_meta("gone", "1");
        old.set_meta("edited", "1");
        let mut new = old.clone();
        new.body = "b".to_string();
        new.meta.remove("gone");
        new.set_meta("edited", "2");
        new.set_meta("added", "1");
        new.categories.insert("News".to_string());
        new.set_field("post_type", "post");
        let description = describe_changes(&old, &new);
        assert!(description.starts_with("body "));
        assert!(description.contains("field +post_type"));
        assert!(description.contains("meta +added"));
        assert!(description.contains("meta ~edited"));
        assert!(description.contains("meta -gone"));
        assert!(description.contains("category +News"));
    }

    #[test]
    fn body_diff_is_unified() {
        let diff = body_diff("post 1", "one\ntwo\n", "one\n2\n");
        assert!(diff.contains("--- post 1 (before)"));
        assert!(diff.contains("-two"));
        assert!(diff.contains("+2"));
    }
}
