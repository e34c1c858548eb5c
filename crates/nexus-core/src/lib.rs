//! Core domain model for the opportunity field reconciler.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nexus-core";

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// One attribute of the opportunity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    BudgetStatus,
    DecisionMaker,
    Tasks,
    NextMeeting,
    Stage,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::BudgetStatus,
        Field::DecisionMaker,
        Field::Tasks,
        Field::NextMeeting,
        Field::Stage,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Field::BudgetStatus => "budget_status",
            Field::DecisionMaker => "decision_maker",
            Field::Tasks => "tasks",
            Field::NextMeeting => "next_meeting",
            Field::Stage => "stage",
        }
    }

    /// Every field except `tasks` holds a single current value.
    pub const fn is_scalar(self) -> bool {
        !matches!(self, Field::Tasks)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Crm,
    Email,
    Bookmark,
    Debrief,
    #[serde(alias = "llm")]
    AdvisoryExtraction,
}

impl SourceType {
    pub const fn as_str(self) -> &'static str {
        match self {
            SourceType::Crm => "crm",
            SourceType::Email => "email",
            SourceType::Bookmark => "bookmark",
            SourceType::Debrief => "debrief",
            SourceType::AdvisoryExtraction => "advisory_extraction",
        }
    }

    /// Advisory output never counts as independent corroboration.
    pub const fn is_advisory(self) -> bool {
        matches!(self, SourceType::AdvisoryExtraction)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Commitment,
    Objection,
    Question,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    pub title: String,
    pub kind: TaskKind,
    pub due: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A field-typed value. The variant names the field it belongs to, so
/// scoring, resolution and record storage branch on the discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    BudgetStatus(String),
    DecisionMaker(String),
    #[serde(rename = "tasks")]
    Task(TaskItem),
    NextMeeting(DateTime<Utc>),
    Stage(String),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::BudgetStatus(_) => Field::BudgetStatus,
            FieldValue::DecisionMaker(_) => Field::DecisionMaker,
            FieldValue::Task(_) => Field::Tasks,
            FieldValue::NextMeeting(_) => Field::NextMeeting,
            FieldValue::Stage(_) => Field::Stage,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::BudgetStatus(s) | FieldValue::DecisionMaker(s) | FieldValue::Stage(s) => {
                Some(s)
            }
            FieldValue::Task(_) | FieldValue::NextMeeting(_) => None,
        }
    }

    pub fn as_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::NextMeeting(at) => Some(*at),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskItem> {
        match self {
            FieldValue::Task(task) => Some(task),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::BudgetStatus(s) | FieldValue::DecisionMaker(s) | FieldValue::Stage(s) => {
                f.write_str(s)
            }
            FieldValue::Task(task) => write!(f, "{:?}: {}", task.kind, task.title),
            FieldValue::NextMeeting(at) => f.write_str(&at.to_rfc3339()),
        }
    }
}

/// One source's claim about one field's value at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub source: SourceType,
    pub value: FieldValue,
    pub timestamp: DateTime<Utc>,
    pub evidence: Option<String>,
}

impl Assertion {
    pub fn new(source: SourceType, value: FieldValue, timestamp: DateTime<Utc>) -> Self {
        Self {
            source,
            value,
            timestamp,
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    pub fn field(&self) -> Field {
        self.value.field()
    }

    /// Fractional days between the assertion and `now`. Negative when the
    /// timestamp lies in the future.
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_milliseconds() as f64 / MILLIS_PER_DAY
    }
}

/// Cost-of-error tier for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

impl Sensitivity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Staged,
    AutoApplied,
    Blocked,
}

impl ChangeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Staged => "staged",
            ChangeStatus::AutoApplied => "auto_applied",
            ChangeStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed mutation to one field.
///
/// `previous` and `applied_at` stay empty until the ledger applies the
/// change; `auto_apply_at` is set only while the change is staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: Uuid,
    pub field: Field,
    pub proposed: FieldValue,
    pub previous: Option<FieldValue>,
    pub confidence: f64,
    pub sensitivity: Sensitivity,
    pub status: ChangeStatus,
    pub rule: String,
    pub auto_apply_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub why: Vec<Arc<Assertion>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditKind {
    Apply,
    Undo,
}

/// Immutable record of an applied or undone mutation.
///
/// For `Undo`, `previous` is the value being reverted and `new` is the value
/// the field was reverted to. `reverts` points at the undone `Apply` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub change_id: Uuid,
    pub field: Field,
    pub previous: Option<FieldValue>,
    pub new: Option<FieldValue>,
    pub confidence: f64,
    pub rule: String,
    pub reverts: Option<Uuid>,
}
