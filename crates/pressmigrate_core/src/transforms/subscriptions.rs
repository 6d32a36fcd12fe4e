use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::delimited::{DelimitedWriter, Delimiter};
use crate::pipeline::{Persister, SkipReason, Transform, Verdict};
use crate::record::{Filter, Record, RecordId, RecordState};
use crate::store::RecordSource;

/// Columns the billing export must carry.
pub const BILLING_COLUMNS: &[&str] = &["email", "plan", "status", "start", "end", "amount", "id"];

/// Header of the generated import file. Downstream tooling depends on this order.
pub const OUTPUT_COLUMNS: &[&str] = &[
    "user_id",
    "email",
    "plan",
    "status",
    "started_at",
    "expires_at",
    "amount_cents",
    "source_id",
];

/// Matches billing rows to users by email and normalizes them into import rows.
pub struct SubscriptionRows {
    users_by_email: BTreeMap<String, Vec<RecordId>>,
}

impl SubscriptionRows {
    /// Indexes every user by lowercased email once, up front.
    pub fn new<S: RecordSource + ?Sized>(users: &S) -> Result<Self> {
        let mut users_by_email: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
        for user in users.find(&Filter::users())? {
            let email = user
                .state
                .field("user_email")
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if !email.is_empty() {
                users_by_email.entry(email).or_default().push(user.id);
            }
        }
        Ok(Self { users_by_email })
    }
}

impl Transform for SubscriptionRows {
    fn apply(&mut self, record: &Record) -> Result<Verdict> {
        let column = |name: &str| record.state.field(name).unwrap_or_default().trim();
        let email = column("email").to_ascii_lowercase();
        if email.is_empty() {
            return Ok(Verdict::Skip(SkipReason::not_found("row has no email")));
        }
        let user_id = match self.users_by_email.get(&email).map(Vec::as_slice) {
            None | Some([]) => {
                return Ok(Verdict::Skip(SkipReason::not_found(format!(
                    "no user with email {email}"
                ))));
            }
            Some([id]) => *id,
            Some(several) => {
                return Ok(Verdict::Skip(SkipReason::ambiguous(format!(
                    "{} users share email {email}",
                    several.len()
                ))));
            }
        };

        let plan = column("plan");
        if plan.is_empty() {
            bail!("row has no plan");
        }
        let started_at = parse_date(column("start"))?;
        let expires_at = match column("end") {
            "" => None,
            value => Some(parse_date(value)?),
        };
        if let Some(expires_at) = expires_at
            && expires_at < started_at
        {
            bail!("subscription ends ({expires_at}) before it starts ({started_at})");
        }
        let amount_cents = parse_amount_cents(column("amount"))?;

        let mut state = RecordState::default();
        state.set_field("user_id", user_id.to_string());
        state.set_field("email", email);
        state.set_field("plan", plan);
        state.set_field("status", column("status").to_ascii_lowercase());
        state.set_field("started_at", started_at.to_string());
        state.set_field(
            "expires_at",
            expires_at.map(|date| date.to_string()).unwrap_or_default(),
        );
        state.set_field("amount_cents", amount_cents.to_string());
        state.set_field("source_id", column("id"));
        Ok(Verdict::Apply(state))
    }
}

/// Accepts `2024-03-01`, `03/01/2024`, RFC 3339 and `2024-03-01 10:00:00`.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        bail!("date is empty");
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%m/%d/%Y") {
        return Ok(date);
    }
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.date_naive());
    }
    if let Ok(timestamp) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(timestamp.date());
    }
    bail!("unrecognized date {value:?}")
}

/// Decimal currency (`$1,299.5`, `-4.00`, `12`) to integer cents.
pub fn parse_amount_cents(value: &str) -> Result<i64> {
    let cleaned = value
        .trim()
        .chars()
        .filter(|ch| !matches!(ch, '$' | ',' | ' '))
        .collect::<String>();
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, cleaned.as_str()),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        bail!("amount {value:?} is empty");
    }
    if !whole.chars().all(|ch| ch.is_ascii_digit())
        || !fraction.chars().all(|ch| ch.is_ascii_digit())
        || fraction.len() > 2
    {
        bail!("amount {value:?} is not a currency value");
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse()? };
    let fraction: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>()? * 10,
        _ => fraction.parse()?,
    };
    let cents = whole
        .checked_mul(100)
        .and_then(|value| value.checked_add(fraction))
        .ok_or_else(|| anyhow::anyhow!("amount {value:?} is out of range"))?;
    Ok(if negative { -cents } else { cents })
}

/// Appends accepted rows to the generated file, created on the first row.
pub struct SubscriptionCsvPersister {
    path: PathBuf,
    delimiter: Delimiter,
    writer: Option<DelimitedWriter>,
}

impl SubscriptionCsvPersister {
    pub fn new(path: &Path, delimiter: Delimiter) -> Self {
        Self {
            path: path.to_path_buf(),
            delimiter,
            writer: None,
        }
    }

    pub fn rows_written(&self) -> usize {
        self.writer.as_ref().map_or(0, DelimitedWriter::rows_written)
    }
}

impl Persister for SubscriptionCsvPersister {
    fn persist(&mut self, _record: &Record, state: &RecordState) -> Result<()> {
        let values = OUTPUT_COLUMNS
            .iter()
            .map(|column| state.field(column).unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        if self.writer.is_none() {
            self.writer = Some(DelimitedWriter::create(
                &self.path,
                self.delimiter,
                OUTPUT_COLUMNS,
            )?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write_row(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::{
        BILLING_COLUMNS, SubscriptionCsvPersister, SubscriptionRows, parse_amount_cents,
        parse_date,
    };
    use crate::delimited::{Delimiter, parse_delimited};
    use crate::outcome_log::OutcomeLog;
    use crate::pipeline::{RunOptions, run_batch};
    use crate::record::{Filter, Record, RecordKind, RecordState};
    use crate::store::MemorySource;

    fn users() -> MemorySource {
        let user = |id: i64, email: &str| {
            let mut state = RecordState::default();
            state.set_field("user_email", email);
            Record::new(id, RecordKind::User, state)
        };
        MemorySource::new(vec![
            user(1, "Reader@Example.com"),
            user(2, "twin@example.com"),
            user(3, "TWIN@example.com"),
        ])
    }

    const BILLING: &str = "email,plan,status,start,end,amount,id\n\
        reader@example.com,Digital Monthly,Active,2024-01-05,,$9.99,ch_1\n\
        twin@example.com,Print,active,2024-01-05,,10,ch_2\n\
        nobody@example.com,Print,active,2024-01-05,,10,ch_3\n\
        reader@example.com,Print,active,2024-02-01,2024-01-01,10,ch_4\n";

    fn run(output: &std::path::Path, dry_run: bool) -> crate::pipeline::RunSummary {
        let rows = parse_delimited(BILLING, Delimiter::Comma).expect("rows");
        assert!(BILLING_COLUMNS.iter().all(|column| rows[0].state.field(column).is_some()));
        let source = MemorySource::new(rows);
        let mut transform = SubscriptionRows::new(&users()).expect("index");
        let mut persister = SubscriptionCsvPersister::new(output, Delimiter::Comma);
        let mut log = OutcomeLog::with_sink("import-subscriptions", Vec::new());
        run_batch(
            &source,
            &Filter::new(RecordKind::Row),
            &mut transform,
            &mut persister,
            &mut log,
            RunOptions {
                dry_run,
                ..RunOptions::default()
            },
        )
        .expect("run")
    }

    #[test]
    fn writes_matched_rows_with_fixed_header() {
        let temp = tempdir().expect("tempdir");
        let output = temp.path().join("out").join("subscriptions.csv");
        let summary = run(&output, false);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.errored, 1);

        let content = fs::read_to_string(&output).expect("read");
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            "user_id,email,plan,status,started_at,expires_at,amount_cents,source_id"
        );
        assert_eq!(
            lines[1],
            "1,reader@example.com,Digital Monthly,active,2024-01-05,,999,ch_1"
        );
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let temp = tempdir().expect("tempdir");
        let output = temp.path().join("subscriptions.csv");
        let summary = run(&output, true);
        assert_eq!(summary.updated, 1);
        assert!(!output.exists());
    }

    #[test]
    fn amounts_become_cents() {
        assert_eq!(parse_amount_cents("$1,299.5").expect("amount"), 129_950);
        assert_eq!(parse_amount_cents("12").expect("amount"), 1_200);
        assert_eq!(parse_amount_cents(".07").expect("amount"), 7);
        assert_eq!(parse_amount_cents("-4.00").expect("amount"), -400);
        assert!(parse_amount_cents("1.234").is_err());
        assert!(parse_amount_cents("ten").is_err());
        assert!(parse_amount_cents("").is_err());
    }

    #[test]
    fn dates_accept_common_export_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1).expect("date");
        for value in [
            "2024-03-01",
            "03/01/2024",
            "2024-03-01T09:30:00Z",
            "2024-03-01 09:30:00",
        ] {
            assert_eq!(parse_date(value).expect(value), expected);
        }
        assert!(parse_date("March 1st").is_err());
    }
}
