//! Change ledger for the opportunity record: staging, timed promotion,
//! application and reversal of field changes, with an append-only audit log.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use nexus_core::{AuditEntry, AuditKind, Change, ChangeStatus, Field, FieldValue, TaskItem};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nexus-ledger";

/// Recoverable outcomes callers are expected to branch on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("no pending change {0}")]
    NotFound(Uuid),
    #[error("change {id} is {status}; only staged changes can be applied")]
    NotStaged { id: Uuid, status: ChangeStatus },
    #[error("change {0} was already applied")]
    AlreadyApplied(Uuid),
    #[error("change {0} is already pending")]
    AlreadyPending(Uuid),
    #[error("deadline for change {0} is out of range")]
    DeadlineOutOfRange(Uuid),
    #[error("audit log has no apply entry to undo")]
    NothingToUndo,
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "not_found",
            LedgerError::NotStaged { .. } => "not_staged",
            LedgerError::AlreadyApplied(_) => "already_applied",
            LedgerError::AlreadyPending(_) => "already_pending",
            LedgerError::DeadlineOutOfRange(_) => "deadline_out_of_range",
            LedgerError::NothingToUndo => "nothing_to_undo",
        }
    }
}

/// Current value of a scalar field plus when it last changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot<T> {
    pub value: Option<T>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            last_updated: None,
        }
    }
}

impl<T> Slot<T> {
    fn set(&mut self, value: Option<T>, at: DateTime<Utc>) {
        self.value = value;
        self.last_updated = Some(at);
    }
}

/// The opportunity. Every field is always present, possibly empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    pub account: Option<String>,
    pub timezone: Option<String>,
    pub budget_status: Slot<String>,
    pub decision_maker: Slot<String>,
    pub next_meeting: Slot<DateTime<Utc>>,
    pub stage: Slot<String>,
    /// Most recent first.
    pub tasks: Vec<TaskItem>,
}

impl Record {
    pub fn new(account: Option<String>, timezone: Option<String>) -> Self {
        Self {
            account,
            timezone,
            ..Self::default()
        }
    }

    /// Current scalar value. Always `None` for `tasks`.
    pub fn current(&self, field: Field) -> Option<FieldValue> {
        match field {
            Field::BudgetStatus => self.budget_status.value.clone().map(FieldValue::BudgetStatus),
            Field::DecisionMaker => self.decision_maker.value.clone().map(FieldValue::DecisionMaker),
            Field::NextMeeting => self.next_meeting.value.map(FieldValue::NextMeeting),
            Field::Stage => self.stage.value.clone().map(FieldValue::Stage),
            Field::Tasks => None,
        }
    }

    /// Rebuilds a record from an empty one by replaying a most-recent-first
    /// audit log oldest entry first.
    pub fn replay<'a>(
        account: Option<String>,
        timezone: Option<String>,
        audit: impl DoubleEndedIterator<Item = &'a AuditEntry>,
    ) -> Self {
        let mut record = Self::new(account, timezone);
        for entry in audit.rev() {
            record.apply_entry(entry);
        }
        record
    }

    /// The only way the record changes: every live mutation is expressed as
    /// the audit entry that describes it.
    fn apply_entry(&mut self, entry: &AuditEntry) {
        match (entry.kind, entry.field) {
            (AuditKind::Apply, Field::Tasks) => {
                if let Some(task) = entry.new.as_ref().and_then(FieldValue::as_task) {
                    self.tasks.insert(0, task.clone());
                }
            }
            (AuditKind::Undo, Field::Tasks) => {
                if let Some(task) = entry.previous.as_ref().and_then(FieldValue::as_task) {
                    self.remove_task_titled(&task.title);
                }
            }
            (_, field) => self.assign(field, entry.new.as_ref(), entry.at),
        }
    }

    fn assign(&mut self, field: Field, value: Option<&FieldValue>, at: DateTime<Utc>) {
        let text = || value.and_then(FieldValue::as_text).map(str::to_string);
        match field {
            Field::BudgetStatus => self.budget_status.set(text(), at),
            Field::DecisionMaker => self.decision_maker.set(text(), at),
            Field::Stage => self.stage.set(text(), at),
            Field::NextMeeting => self
                .next_meeting
                .set(value.and_then(FieldValue::as_instant), at),
            Field::Tasks => {}
        }
    }

    /// Removes the first task with exactly this title.
    fn remove_task_titled(&mut self, title: &str) -> Option<TaskItem> {
        let idx = self.tasks.iter().position(|t| t.title == title)?;
        Some(self.tasks.remove(idx))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    pub auto_apply_delay: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            auto_apply_delay: Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub record: Record,
    pub pending: Vec<Change>,
}

/// Owns the record, the pending changes and the audit log.
#[derive(Debug)]
pub struct Ledger {
    config: LedgerConfig,
    record: Record,
    /// Staged or blocked changes, most recent first.
    pending: VecDeque<Change>,
    /// Most recent first.
    audit: VecDeque<AuditEntry>,
    applied: HashSet<Uuid>,
}

impl Ledger {
    /// Starts from an empty record so the audit log alone reproduces it.
    pub fn new(account: Option<String>, timezone: Option<String>, config: LedgerConfig) -> Self {
        Self {
            config,
            record: Record::new(account, timezone),
            pending: VecDeque::new(),
            audit: VecDeque::new(),
            applied: HashSet::new(),
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn pending(&self) -> impl Iterator<Item = &Change> {
        self.pending.iter()
    }

    pub fn audit(&self) -> impl DoubleEndedIterator<Item = &AuditEntry> {
        self.audit.iter()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            record: self.record.clone(),
            pending: self.pending.iter().cloned().collect(),
        }
    }

    /// Record rebuilt from the audit log alone.
    pub fn replayed_record(&self) -> Record {
        Record::replay(
            self.record.account.clone(),
            self.record.timezone.clone(),
            self.audit.iter(),
        )
    }

    pub fn propose(&mut self, change: Change) -> Result<Change, LedgerError> {
        self.propose_at(change, Utc::now())
    }

    /// Auto-applied changes are applied right away; staged ones get a
    /// deadline; blocked ones wait without one. An id that is already
    /// pending or applied is refused.
    pub fn propose_at(&mut self, mut change: Change, now: DateTime<Utc>) -> Result<Change, LedgerError> {
        if self.applied.contains(&change.id) {
            return Err(LedgerError::AlreadyApplied(change.id));
        }
        if self.pending.iter().any(|c| c.id == change.id) {
            return Err(LedgerError::AlreadyPending(change.id));
        }
        match change.status {
            ChangeStatus::AutoApplied => {
                self.apply(&mut change, now)?;
                return Ok(change);
            }
            ChangeStatus::Staged => {
                let deadline = now
                    .checked_add_signed(self.config.auto_apply_delay)
                    .ok_or(LedgerError::DeadlineOutOfRange(change.id))?;
                change.auto_apply_at = Some(deadline);
            }
            ChangeStatus::Blocked => {
                change.auto_apply_at = None;
            }
        }
        info!(
            change_id = %change.id,
            field = %change.field,
            status = %change.status,
            confidence = change.confidence,
            auto_apply_at = ?change.auto_apply_at,
            "proposed change"
        );
        self.pending.push_front(change.clone());
        Ok(change)
    }

    pub fn apply_change(&mut self, id: Uuid) -> Result<Change, LedgerError> {
        self.apply_change_at(id, Utc::now())
    }

    /// Manual promotion of a staged change.
    pub fn apply_change_at(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<Change, LedgerError> {
        let idx = self
            .pending
            .iter()
            .position(|c| c.id == id)
            .ok_or(LedgerError::NotFound(id))?;
        let status = self.pending[idx].status;
        if status != ChangeStatus::Staged {
            return Err(LedgerError::NotStaged { id, status });
        }
        if self.applied.contains(&id) {
            return Err(LedgerError::AlreadyApplied(id));
        }

        let mut change = self.pending.remove(idx).ok_or(LedgerError::NotFound(id))?;
        change.status = ChangeStatus::AutoApplied;
        self.apply(&mut change, now)?;
        Ok(change)
    }

    pub fn undo_last(&mut self) -> Result<AuditEntry, LedgerError> {
        self.undo_last_at(Utc::now())
    }

    /// Reverts the single most recent apply. Once that apply has been undone
    /// there is nothing left to undo.
    pub fn undo_last_at(&mut self, now: DateTime<Utc>) -> Result<AuditEntry, LedgerError> {
        let target = self
            .audit
            .iter()
            .find(|e| e.kind == AuditKind::Apply)
            .ok_or(LedgerError::NothingToUndo)?;
        let already_reverted = self
            .audit
            .iter()
            .take_while(|e| e.id != target.id)
            .any(|e| e.reverts == Some(target.id));
        if already_reverted {
            return Err(LedgerError::NothingToUndo);
        }

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            at: now,
            kind: AuditKind::Undo,
            change_id: target.change_id,
            field: target.field,
            previous: target.new.clone(),
            new: target.previous.clone(),
            confidence: target.confidence,
            rule: target.rule.clone(),
            reverts: Some(target.id),
        };
        self.record.apply_entry(&entry);
        self.audit.push_front(entry.clone());
        info!(
            change_id = %entry.change_id,
            field = %entry.field,
            "undid change"
        );
        Ok(entry)
    }

    pub fn expire_deadlines(&mut self) -> Vec<Change> {
        self.expire_deadlines_at(Utc::now())
    }

    /// Promotes every staged change whose deadline has passed, oldest
    /// deadline first.
    pub fn expire_deadlines_at(&mut self, now: DateTime<Utc>) -> Vec<Change> {
        let mut due = self
            .pending
            .iter()
            .rev()
            .filter(|c| c.status == ChangeStatus::Staged)
            .filter_map(|c| c.auto_apply_at.filter(|at| *at <= now).map(|at| (at, c.id)))
            .collect::<Vec<_>>();
        due.sort_by_key(|(at, _)| *at);

        let mut promoted = Vec::with_capacity(due.len());
        for (_, id) in due {
            match self.apply_change_at(id, now) {
                Ok(change) => {
                    info!(change_id = %change.id, field = %change.field, "auto-applied after deadline");
                    promoted.push(change);
                }
                Err(err) => debug!(change_id = %id, error = %err, "skipped expired change"),
            }
        }
        promoted
    }

    fn apply(&mut self, change: &mut Change, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if !self.applied.insert(change.id) {
            return Err(LedgerError::AlreadyApplied(change.id));
        }
        change.previous = self.record.current(change.field);
        change.applied_at = Some(now);
        change.auto_apply_at = None;

        let entry = AuditEntry {
            id: Uuid::new_v4(),
            at: now,
            kind: AuditKind::Apply,
            change_id: change.id,
            field: change.field,
            previous: change.previous.clone(),
            new: Some(change.proposed.clone()),
            confidence: change.confidence,
            rule: change.rule.clone(),
            reverts: None,
        };
        self.record.apply_entry(&entry);
        self.audit.push_front(entry);
        info!(
            change_id = %change.id,
            field = %change.field,
            status = %change.status,
            confidence = change.confidence,
            "applied change"
        );
        Ok(())
    }
}

/// Serializes every ledger operation behind one lock. Reads sweep expired
/// deadlines first.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    inner: Arc<Mutex<Ledger>>,
}

impl LedgerHandle {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    /// Runs `f` with exclusive access, for callers that need several
    /// operations to happen atomically.
    pub async fn with<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let mut ledger = self.inner.lock().await;
        f(&mut ledger)
    }

    pub async fn replace(&self, ledger: Ledger) {
        *self.inner.lock().await = ledger;
    }

    pub async fn propose(&self, change: Change) -> Result<Change, LedgerError> {
        self.inner.lock().await.propose(change)
    }

    pub async fn apply_change(&self, id: Uuid) -> Result<Change, LedgerError> {
        self.inner.lock().await.apply_change(id)
    }

    pub async fn undo_last(&self) -> Result<AuditEntry, LedgerError> {
        self.inner.lock().await.undo_last()
    }

    pub async fn expire_deadlines(&self) -> Vec<Change> {
        self.inner.lock().await.expire_deadlines()
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let mut ledger = self.inner.lock().await;
        ledger.expire_deadlines();
        ledger.snapshot()
    }

    pub async fn audit(&self) -> Vec<AuditEntry> {
        let mut ledger = self.inner.lock().await;
        ledger.expire_deadlines();
        ledger.audit().cloned().collect()
    }
}
