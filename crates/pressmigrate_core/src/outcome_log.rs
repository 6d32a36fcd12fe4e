use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::pipeline::{Outcome, OutcomeKind, RunMode, RunSummary};

/// Streams run events to stdout, `tracing` and an append-only log sink.
pub struct OutcomeLog<W: Write = File> {
    command: String,
    sink: W,
    path: Option<PathBuf>,
    progress: bool,
    total: usize,
    position: usize,
}

impl OutcomeLog<File> {
    /// Appends to `<log_dir>/<command>.log`, creating it if needed.
    pub fn open(log_dir: &Path, command: &str) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
        let path = log_dir.join(format!("{command}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let mut log = Self::with_sink(command, file);
        log.path = Some(path);
        log.progress = true;
        Ok(log)
    }
}

impl<W: Write> OutcomeLog<W> {
    /// Log over any sink, without stdout progress lines.
    pub fn with_sink(command: &str, sink: W) -> Self {
        Self {
            command: command.to_string(),
            sink,
            path: None,
            progress: false,
            total: 0,
            position: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    pub fn start(&mut self, mode: RunMode, total: usize) -> Result<()> {
        self.total = total;
        self.position = 0;
        info!(command = %self.command, mode = mode.as_str(), total, "run started");
        let line = format!(
            "run started: command={} mode={} records={total}",
            self.command,
            mode.as_str()
        );
        if self.progress {
            println!("{} ({}): {total} record(s)", self.command, mode.as_str());
        }
        self.append(&line)
    }

    pub fn record(&mut self, outcome: &Outcome) -> Result<()> {
        self.position += 1;
        let line = outcome_line(outcome);
        match outcome.kind {
            OutcomeKind::Unchanged | OutcomeKind::Updated => {
                debug!(record = %outcome.label, outcome = outcome.kind.as_str(), "{}", outcome.reason);
            }
            OutcomeKind::Skipped | OutcomeKind::Error => {
                warn!(record = %outcome.label, outcome = outcome.kind.as_str(), "{}", outcome.reason);
            }
        }
        if self.progress {
            println!("[{}/{}] {line}", self.position, self.total);
        }
        self.append(&line)
    }

    /// Free-form note, e.g. a diff header or a category that was created.
    pub fn note(&mut self, text: &str) -> Result<()> {
        info!(command = %self.command, "{text}");
        self.append(text)
    }

    pub fn finish(&mut self, summary: &RunSummary) -> Result<()> {
        let line = format!("run finished: {}", summary.render());
        info!(
            command = %self.command,
            processed = summary.processed(),
            updated = summary.updated,
            unchanged = summary.unchanged,
            skipped = summary.skipped,
            errored = summary.errored,
            "run finished"
        );
        self.append(&line)
    }

    fn append(&mut self, text: &str) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        for line in text.lines() {
            writeln!(self.sink, "{timestamp}\t{line}").context("failed to append to outcome log")?;
        }
        self.sink.flush().context("failed to flush outcome log")
    }
}

/// Per-record line. Carries no run mode so dry and real runs log identical text.
pub fn outcome_line(outcome: &Outcome) -> String {
    if outcome.reason.is_empty() {
        format!("{}: {}", outcome.label, outcome.kind.as_str())
    } else {
        format!("{}: {} ({})", outcome.label, outcome.kind.as_str(), outcome.reason)
    }
}

/// Event texts of a log, timestamps removed.
pub fn strip_timestamps(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| {
            line.split_once('\t')
                .map_or(line, |(_, text)| text)
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{OutcomeLog, outcome_line, strip_timestamps};
    use crate::pipeline::{Outcome, OutcomeKind, RunMode, RunSummary};

    fn outcome(kind: OutcomeKind, reason: &str) -> Outcome {
        Outcome {
            record_id: 7,
            label: "post 7".to_string(),
            kind,
            reason: reason.to_string(),
            error_kind: None,
        }
    }

    #[test]
    fn lines_are_timestamped_and_tab_separated() {
        let mut log = OutcomeLog::with_sink("headings", Vec::new());
        log.start(RunMode::DryRun, 1).expect("start");
        log.record(&outcome(OutcomeKind::Updated, "body")).expect("record");
        log.finish(&RunSummary {
            updated: 1,
            elapsed: Duration::from_millis(1500),
            ..RunSummary::default()
        })
        .expect("finish");

        let content = String::from_utf8(log.into_sink()).expect("utf8");
        for line in content.lines() {
            let (timestamp, _) = line.split_once('\t').expect("tab");
            assert!(timestamp.ends_with('Z'), "{timestamp}");
        }
        let texts = strip_timestamps(&content);
        assert_eq!(texts[0], "run started: command=headings mode=dry-run records=1");
        assert_eq!(texts[1], "post 7: updated (body)");
        assert!(texts[2].starts_with("run finished: processed=1 updated=1"));
    }

    #[test]
    fn open_appends_across_runs() {
        let temp = tempdir().expect("tempdir");
        let log_dir = temp.path().join("logs");
        for _ in 0..2 {
            let mut log = OutcomeLog::open(&log_dir, "avatars").expect("open");
            log.record(&outcome(OutcomeKind::Unchanged, "")).expect("record");
        }
        let content = fs::read_to_string(log_dir.join("avatars.log")).expect("read");
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn outcome_line_omits_empty_reason() {
        assert_eq!(outcome_line(&outcome(OutcomeKind::Unchanged, "")), "post 7: unchanged");
        assert_eq!(
            outcome_line(&outcome(OutcomeKind::Skipped, "not_found: no image")),
            "post 7: skipped (not_found: no image)"
        );
    }
}
