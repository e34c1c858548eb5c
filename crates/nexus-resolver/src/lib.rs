//! Source scoring, blast-radius policy and change resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nexus_core::{Assertion, Change, ChangeStatus, Field, FieldValue, Sensitivity, SourceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nexus-resolver";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no evidence supplied for {0}")]
    NoEvidence(Field),
    #[error("assertion about {found} supplied while resolving {expected}")]
    FieldMismatch { expected: Field, found: Field },
}

/// Fixed per-source trust weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePriors {
    pub debrief: f64,
    pub email: f64,
    pub advisory_extraction: f64,
    pub bookmark: f64,
    pub crm: f64,
}

impl Default for SourcePriors {
    fn default() -> Self {
        Self {
            debrief: 0.40,
            email: 0.30,
            advisory_extraction: 0.25,
            bookmark: 0.20,
            crm: 0.10,
        }
    }
}

impl SourcePriors {
    pub fn for_source(&self, source: SourceType) -> f64 {
        match source {
            SourceType::Debrief => self.debrief,
            SourceType::Email => self.email,
            SourceType::AdvisoryExtraction => self.advisory_extraction,
            SourceType::Bookmark => self.bookmark,
            SourceType::Crm => self.crm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub priors: SourcePriors,
    pub half_life_days: f64,
    pub agreement_window_days: f64,
    pub agreement_min_sources: usize,
    pub agreement_boost: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            priors: SourcePriors::default(),
            half_life_days: 45.0,
            agreement_window_days: 30.0,
            agreement_min_sources: 2,
            agreement_boost: 0.10,
        }
    }
}

/// Aggregate score for one distinct candidate value.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub value: FieldValue,
    pub score: f64,
    pub boosted: bool,
    pub support: Vec<Arc<Assertion>>,
}

/// `0.5 ^ (age / half_life)`, with age floored at zero.
pub fn recency_weight(age_days: f64, half_life_days: f64) -> f64 {
    0.5_f64.powf(age_days.max(0.0) / half_life_days)
}

pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn weight(&self, assertion: &Assertion, now: DateTime<Utc>) -> f64 {
        recency_weight(assertion.age_days(now), self.config.half_life_days)
            * self.config.priors.for_source(assertion.source)
    }

    /// Scores every distinct candidate value. Groups come back in the order
    /// their first assertion appears in `assertions`.
    pub fn score_at(&self, assertions: &[Arc<Assertion>], now: DateTime<Utc>) -> Vec<CandidateScore> {
        let mut groups: Vec<CandidateScore> = Vec::new();

        for assertion in assertions {
            let inc = self.weight(assertion, now);
            match groups.iter_mut().find(|g| g.value == assertion.value) {
                Some(group) => {
                    group.score += inc;
                    group.support.push(Arc::clone(assertion));
                }
                None => groups.push(CandidateScore {
                    value: assertion.value.clone(),
                    score: inc,
                    boosted: false,
                    support: vec![Arc::clone(assertion)],
                }),
            }
        }

        for group in &mut groups {
            let corroborating = group
                .support
                .iter()
                .filter(|a| {
                    !a.source.is_advisory()
                        && a.age_days(now) <= self.config.agreement_window_days
                })
                .count();
            if corroborating >= self.config.agreement_min_sources {
                group.score += self.config.agreement_boost;
                group.boosted = true;
            }
            group.score = group.score.clamp(0.0, 1.0);
        }

        groups
    }

    /// Highest-scoring candidate. On equal scores the earlier group wins.
    pub fn best_at(&self, assertions: &[Arc<Assertion>], now: DateTime<Utc>) -> Option<CandidateScore> {
        let mut best: Option<CandidateScore> = None;
        for candidate in self.score_at(assertions, now) {
            let replace = match &best {
                Some(current) => candidate.score > current.score,
                None => true,
            };
            if replace {
                best = Some(candidate);
            }
        }
        best
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub sensitivity: Sensitivity,
    pub threshold: f64,
}

impl PolicyRule {
    pub fn describe(&self) -> String {
        format!("{}: auto ≥{:.2}", self.sensitivity, self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Scores below this are blocked outright.
    pub block_below: f64,
    /// High-sensitivity fields auto-apply only at or above this score.
    pub high_certainty: f64,
    pub fields: BTreeMap<Field, PolicyRule>,
    pub fallback: PolicyRule,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let medium = PolicyRule {
            sensitivity: Sensitivity::Medium,
            threshold: 0.80,
        };
        let fields = BTreeMap::from([
            (
                Field::Tasks,
                PolicyRule {
                    sensitivity: Sensitivity::Low,
                    threshold: 0.80,
                },
            ),
            (Field::BudgetStatus, medium),
            (Field::NextMeeting, medium),
            (Field::Stage, medium),
            (
                Field::DecisionMaker,
                PolicyRule {
                    sensitivity: Sensitivity::High,
                    threshold: 0.90,
                },
            ),
        ]);
        Self {
            block_below: 0.50,
            high_certainty: 0.95,
            fields,
            fallback: medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub status: ChangeStatus,
    pub rule: PolicyRule,
}

pub struct Policy {
    config: PolicyConfig,
}

impl Policy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn rule_for(&self, field: Field) -> PolicyRule {
        self.config
            .fields
            .get(&field)
            .copied()
            .unwrap_or(self.config.fallback)
    }

    pub fn decide(&self, field: Field, score: f64) -> Decision {
        let rule = self.rule_for(field);
        let status = if score < self.config.block_below {
            ChangeStatus::Blocked
        } else if score >= rule.threshold {
            if rule.sensitivity == Sensitivity::High && score < self.config.high_certainty {
                ChangeStatus::Staged
            } else {
                ChangeStatus::AutoApplied
            }
        } else {
            ChangeStatus::Staged
        };
        Decision { status, rule }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

/// Scorer + Policy. Pure apart from the clock and id generation.
#[derive(Default)]
pub struct Resolver {
    scorer: Scorer,
    policy: Policy,
}

impl Resolver {
    pub fn new(scoring: ScoringConfig, policy: PolicyConfig) -> Self {
        Self {
            scorer: Scorer::new(scoring),
            policy: Policy::new(policy),
        }
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn resolve(&self, field: Field, assertions: &[Arc<Assertion>]) -> Result<Change, ResolveError> {
        self.resolve_at(field, assertions, Utc::now())
    }

    pub fn resolve_at(
        &self,
        field: Field,
        assertions: &[Arc<Assertion>],
        now: DateTime<Utc>,
    ) -> Result<Change, ResolveError> {
        if let Some(stray) = assertions.iter().find(|a| a.field() != field) {
            return Err(ResolveError::FieldMismatch {
                expected: field,
                found: stray.field(),
            });
        }
        let best = self
            .scorer
            .best_at(assertions, now)
            .ok_or(ResolveError::NoEvidence(field))?;

        debug!(
            %field,
            candidate = %best.value,
            score = best.score,
            boosted = best.boosted,
            support = best.support.len(),
            "resolved field"
        );
        Ok(self.build_change(field, best.value, best.score, best.support))
    }

    /// Change for an explicit user command (bookmark, spoken commitment)
    /// whose confidence is asserted by the producer rather than scored.
    pub fn resolve_explicit(&self, assertion: Arc<Assertion>, confidence: f64) -> Change {
        let field = assertion.field();
        let value = assertion.value.clone();
        self.build_change(field, value, confidence, vec![assertion])
    }

    fn build_change(
        &self,
        field: Field,
        proposed: FieldValue,
        confidence: f64,
        why: Vec<Arc<Assertion>>,
    ) -> Change {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let decision = self.policy.decide(field, confidence);
        Change {
            id: Uuid::new_v4(),
            field,
            proposed,
            previous: None,
            confidence,
            sensitivity: decision.rule.sensitivity,
            status: decision.status,
            rule: decision.rule.describe(),
            auto_apply_at: None,
            applied_at: None,
            why,
        }
    }
}
