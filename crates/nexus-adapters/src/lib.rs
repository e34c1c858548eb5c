//! Assertion producers: debrief transcript rules, bookmarks, advisory
//! extraction output and seed fixtures.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{
    DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc, Weekday,
};
use nexus_advisory::AdvisoryExtract;
use nexus_core::{Assertion, Field, FieldValue, SourceType, TaskItem, TaskKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "nexus-adapters";

/// Confidence asserted by an explicit "bookmark that" command.
pub const BOOKMARK_CONFIDENCE: f64 = 0.95;
/// Confidence asserted by a commitment spoken during a debrief.
pub const DEBRIEF_TASK_CONFIDENCE: f64 = 0.92;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("seed age of {age_days} days for {field} is out of range")]
    SeedAgeOutOfRange { field: Field, age_days: i64 },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// What a producer hands to the resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    /// Scored against everything else known about the field.
    Scored(Assertion),
    /// An explicit command whose confidence the producer asserts.
    Explicit { assertion: Assertion, confidence: f64 },
}

impl Evidence {
    pub fn assertion(&self) -> &Assertion {
        match self {
            Evidence::Scored(assertion) | Evidence::Explicit { assertion, .. } => assertion,
        }
    }

    pub fn field(&self) -> Field {
        self.assertion().field()
    }
}

// ---------------------------------------------------------------------------
// Spoken dates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
}

fn default_meeting_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != ':')
                .to_ascii_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn parse_weekday(token: &str) -> Option<Weekday> {
    match token {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// A named day wins over "today", which debriefs use loosely ("budget
/// resolved today").
fn spoken_day(tokens: &[String], today: NaiveDate) -> Option<NaiveDate> {
    for (i, token) in tokens.iter().enumerate() {
        if token == "tomorrow" {
            return today.succ_opt();
        }
        if let Some(weekday) = parse_weekday(token) {
            let ahead = (7 + weekday.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
            let said_this = i > 0 && tokens[i - 1] == "this";
            let ahead = if ahead == 0 && !said_this { 7 } else { ahead };
            return today.checked_add_days(Days::new(u64::from(ahead)));
        }
    }
    tokens
        .iter()
        .any(|t| t == "today" || t == "tonight")
        .then_some(today)
}

fn spoken_time(tokens: &[String]) -> Option<NaiveTime> {
    for (i, token) in tokens.iter().enumerate() {
        if token == "noon" {
            return NaiveTime::from_hms_opt(12, 0, 0);
        }
        let next = tokens.get(i + 1).map(String::as_str);
        let (body, meridiem) = if let Some(body) = token.strip_suffix("pm") {
            (body, Some(Meridiem::Pm))
        } else if let Some(body) = token.strip_suffix("am") {
            (body, Some(Meridiem::Am))
        } else {
            match next {
                Some("pm" | "p.m") => (token.as_str(), Some(Meridiem::Pm)),
                Some("am" | "a.m") => (token.as_str(), Some(Meridiem::Am)),
                _ => (token.as_str(), None),
            }
        };
        if body.is_empty() {
            continue;
        }

        let (hour, minute) = match body.split_once(':') {
            Some((h, m)) => (h.parse::<u32>().ok(), m.parse::<u32>().ok()),
            // A bare number is only a time when am/pm follows it.
            None if meridiem.is_some() => (body.parse::<u32>().ok(), Some(0)),
            None => continue,
        };
        let (Some(hour), Some(minute)) = (hour, minute) else {
            continue;
        };
        let hour = match meridiem {
            Some(_) if hour == 0 || hour > 12 => continue,
            Some(Meridiem::Pm) if hour < 12 => hour + 12,
            Some(Meridiem::Am) if hour == 12 => 0,
            _ => hour,
        };
        if let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) {
            return Some(time);
        }
    }
    None
}

/// Resolves phrases like "Friday 5pm", "tomorrow" or "at 17:00" to the next
/// matching instant in the given local offset. Dates without a time land at
/// 09:00; times without a date land on the next occurrence of that time.
pub fn normalize_date(text: &str, offset: FixedOffset, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local_now = now.with_timezone(&offset);
    let today = local_now.date_naive();
    let tokens = tokenize(text);

    let (date, time) = match (spoken_day(&tokens, today), spoken_time(&tokens)) {
        (None, None) => return None,
        (Some(date), time) => (date, time.unwrap_or_else(default_meeting_time)),
        (None, Some(time)) if time > local_now.time() => (today, time),
        (None, Some(time)) => (today.succ_opt()?, time),
    };
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|at| at.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Debrief transcripts
// ---------------------------------------------------------------------------

/// Rule-based reading of a debrief transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DebriefParse {
    pub budget_status: Option<String>,
    pub decision_maker: Option<String>,
    pub stage: Option<String>,
    pub next_meeting: Option<DateTime<Utc>>,
    pub task: Option<TaskItem>,
}

fn is_capitalized_word(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {
            let rest = chars.collect::<Vec<_>>();
            !rest.is_empty() && rest.iter().all(char::is_ascii_lowercase)
        }
        _ => false,
    }
}

/// "David Chen—C-H-E-N": a two-word name immediately followed by a dash and
/// at least two spelled-out capital letters.
fn spelled_name(transcript: &str) -> Option<String> {
    for (idx, dash) in transcript
        .char_indices()
        .filter(|(_, c)| matches!(*c, '—' | '–' | '-'))
    {
        let before = &transcript[..idx];
        if before.ends_with(char::is_whitespace) {
            continue;
        }
        let words = before.split_whitespace().rev().take(2).collect::<Vec<_>>();
        if words.len() != 2 || !words.iter().all(|w| is_capitalized_word(w)) {
            continue;
        }
        let after = &transcript[idx + dash.len_utf8()..];
        let spelled = after
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_uppercase() || matches!(*c, '-' | '–' | ' '))
            .filter(char::is_ascii_uppercase)
            .count();
        if spelled >= 2 {
            return Some(format!("{} {}", words[1], words[0]));
        }
    }
    None
}

fn clean_word(word: &str) -> &str {
    word.trim_matches(|c: char| !c.is_alphanumeric())
}

/// Words following `marker` in `text`, matched case-insensitively.
fn words_after<'a>(text: &'a str, marker: &str, count: usize) -> Option<Vec<&'a str>> {
    let idx = text.to_ascii_lowercase().find(marker)?;
    let words = text[idx + marker.len()..]
        .split_whitespace()
        .take(count)
        .map(clean_word)
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    (words.len() == count).then_some(words)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

pub fn parse_debrief(transcript: &str, offset: FixedOffset, now: DateTime<Utc>) -> DebriefParse {
    let lower = transcript.to_ascii_lowercase();
    let mut out = DebriefParse::default();

    if lower.contains("budget freeze") || lower.contains("budget is frozen") {
        out.budget_status = Some("Freeze".to_string());
    }
    if lower.contains("budget resolved") {
        out.budget_status = Some("Resolved Today".to_string());
    }
    if lower.contains("budget approved") {
        out.budget_status = Some("Approved".to_string());
    }

    out.decision_maker = spelled_name(transcript).or_else(|| {
        words_after(transcript, "decision maker is ", 2)
            .filter(|w| w.iter().all(|w| w.chars().all(char::is_alphabetic)))
            .map(|w| format!("{} {}", title_case(w[0]), title_case(w[1])))
    });

    out.stage = ["stage is ", "stage to "]
        .iter()
        .find_map(|marker| words_after(transcript, marker, 1))
        .map(|w| title_case(w[0]));

    if let Some(due) = normalize_date(transcript, offset, now) {
        let title = if lower.contains("soc2") || lower.contains("soc 2") {
            Some("Follow-up: SOC 2 evidence")
        } else if lower.contains("proposal") {
            Some("Send proposal")
        } else {
            None
        };
        out.task = title.map(|title| TaskItem {
            title: title.to_string(),
            kind: TaskKind::Commitment,
            due: Some(due),
            created_at: now,
        });
        if lower.contains("meeting") || lower.contains("call") {
            out.next_meeting = Some(due);
        }
    }

    out
}

/// Turns a debrief reading, plus optional advisory output, into evidence.
/// Advisory values win over rule-based ones and are attributed to the
/// advisory source.
pub fn debrief_evidence(
    parsed: &DebriefParse,
    advisory: Option<&AdvisoryExtract>,
    now: DateTime<Utc>,
) -> Vec<Evidence> {
    let debrief = |value: FieldValue, note: &str| {
        Evidence::Scored(Assertion::new(SourceType::Debrief, value, now).with_evidence(note))
    };
    let advised = |value: FieldValue| {
        Evidence::Scored(
            Assertion::new(SourceType::AdvisoryExtraction, value, now)
                .with_evidence("advisory extraction"),
        )
    };

    let mut out = Vec::new();

    match advisory.and_then(|a| a.budget_status.clone()) {
        Some(value) => out.push(advised(FieldValue::BudgetStatus(value))),
        None => {
            if let Some(value) = &parsed.budget_status {
                out.push(debrief(FieldValue::BudgetStatus(value.clone()), "debrief keyword"));
            }
        }
    }

    match advisory.and_then(|a| a.decision_maker.clone()) {
        Some(value) => out.push(advised(FieldValue::DecisionMaker(value))),
        None => {
            if let Some(value) = &parsed.decision_maker {
                out.push(debrief(FieldValue::DecisionMaker(value.clone()), "spelled-name lock"));
            }
        }
    }

    let advised_meeting = advisory
        .and_then(|a| a.next_meeting.as_deref())
        .and_then(|raw| match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(err) => {
                warn!(raw, error = %err, "ignoring advisory next_meeting");
                None
            }
        });
    match advised_meeting {
        Some(at) => out.push(advised(FieldValue::NextMeeting(at))),
        None => {
            if let Some(at) = parsed.next_meeting {
                out.push(debrief(FieldValue::NextMeeting(at), "debrief date"));
            }
        }
    }

    if let Some(stage) = &parsed.stage {
        out.push(debrief(FieldValue::Stage(stage.clone()), "debrief stage"));
    }

    if let Some(task) = &parsed.task {
        out.push(Evidence::Explicit {
            assertion: Assertion::new(SourceType::Debrief, FieldValue::Task(task.clone()), now)
                .with_evidence("debrief commitment"),
            confidence: DEBRIEF_TASK_CONFIDENCE,
        });
    }

    out
}

// ---------------------------------------------------------------------------
// Bookmarks
// ---------------------------------------------------------------------------

const BOOKMARK_COMMAND: &str = "bookmark that";

/// Drops the spoken "bookmark that" command wherever it occurs.
pub fn strip_bookmark_command(transcript: &str) -> String {
    let mut text = transcript.to_string();
    while let Some(idx) = text.to_ascii_lowercase().find(BOOKMARK_COMMAND) {
        text.replace_range(idx..idx + BOOKMARK_COMMAND.len(), " ");
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn classify_bookmark(text: &str) -> TaskKind {
    let lower = text.to_ascii_lowercase();
    if lower.ends_with('?') || lower.contains("what about") {
        TaskKind::Question
    } else if ["block", "risk", "can't"].iter().any(|w| lower.contains(w)) {
        TaskKind::Objection
    } else {
        TaskKind::Commitment
    }
}

pub fn bookmark_task(transcript: &str, offset: FixedOffset, now: DateTime<Utc>) -> TaskItem {
    let text = strip_bookmark_command(transcript);
    let kind = classify_bookmark(&text);
    let due = normalize_date(&text, offset, now);
    let title = if text.is_empty() {
        "Bookmarked item".to_string()
    } else {
        text
    };
    TaskItem {
        title,
        kind,
        due,
        created_at: now,
    }
}

pub fn bookmark_evidence(transcript: &str, offset: FixedOffset, now: DateTime<Utc>) -> Evidence {
    let task = bookmark_task(transcript, offset, now);
    Evidence::Explicit {
        assertion: Assertion::new(SourceType::Bookmark, FieldValue::Task(task), now)
            .with_evidence(transcript.trim()),
        confidence: BOOKMARK_CONFIDENCE,
    }
}

// ---------------------------------------------------------------------------
// Seed fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedBundle {
    pub account: String,
    pub timezone: String,
    #[serde(default)]
    pub assertions: Vec<SeedAssertion>,
}

/// Historical claim, backdated by `age_days` from load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAssertion {
    pub source: SourceType,
    pub field: Field,
    pub value: JsonValue,
    pub age_days: i64,
    #[serde(default)]
    pub evidence: Option<String>,
}

impl SeedAssertion {
    pub fn to_assertion(&self, now: DateTime<Utc>) -> Result<Assertion, AdapterError> {
        let value: FieldValue = serde_json::from_value(serde_json::json!({
            "field": self.field,
            "value": self.value,
        }))
        .with_context(|| format!("seed value for {} does not fit the field", self.field))?;
        let timestamp = TimeDelta::try_days(self.age_days)
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or(AdapterError::SeedAgeOutOfRange {
                field: self.field,
                age_days: self.age_days,
            })?;
        let mut assertion = Assertion::new(self.source, value, timestamp);
        assertion.evidence = self.evidence.clone();
        Ok(assertion)
    }
}

impl SeedBundle {
    pub fn assertions_at(&self, now: DateTime<Utc>) -> Result<Vec<Assertion>, AdapterError> {
        self.assertions.iter().map(|a| a.to_assertion(now)).collect()
    }
}

fn seed(source: SourceType, field: Field, value: &str, age_days: i64, evidence: &str) -> SeedAssertion {
    SeedAssertion {
        source,
        field,
        value: JsonValue::String(value.to_string()),
        age_days,
        evidence: Some(evidence.to_string()),
    }
}

/// Demo opportunity with visible budget and decision-maker conflicts.
pub fn builtin_seed() -> SeedBundle {
    SeedBundle {
        account: "Acme Robotics".to_string(),
        timezone: "America/New_York".to_string(),
        assertions: vec![
            seed(SourceType::Crm, Field::BudgetStatus, "Approved", 90, "CRM field"),
            seed(SourceType::Email, Field::BudgetStatus, "Freeze", 7, "emails.mbox msg-1"),
            seed(SourceType::Crm, Field::DecisionMaker, "Mark Delaney", 90, "CRM field"),
            seed(SourceType::Email, Field::DecisionMaker, "David Chan", 5, "emails.mbox msg-2"),
        ],
    }
}

pub fn load_seed_bundle(path: impl AsRef<Path>) -> Result<SeedBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
