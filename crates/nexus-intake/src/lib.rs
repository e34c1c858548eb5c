//! Intake orchestration: configuration, rule overrides, evidence history and
//! the debrief/bookmark pipeline feeding the change ledger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use nexus_adapters::{
    bookmark_evidence, builtin_seed, debrief_evidence, load_seed_bundle, parse_debrief,
    DebriefParse, Evidence, SeedBundle,
};
use nexus_advisory::{
    AdvisoryConfig, AdvisoryExtract, AdvisoryExtractor, DisabledExtractor, HttpExtractor,
};
use nexus_core::{Assertion, Change, Field, FieldValue, TaskItem};
use nexus_ledger::{Ledger, LedgerConfig, LedgerHandle};
use nexus_resolver::{PolicyConfig, Resolver, ScoringConfig};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "nexus-intake";

/// Spoken-word goal reported by the word-count command.
pub const WORD_TARGET: usize = 2000;

/// Longest staging delay accepted from configuration: one year.
pub const MAX_AUTO_APPLY_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub workspace_root: PathBuf,
    pub utc_offset_hours: i32,
    pub auto_apply_hours: i64,
    pub scheduler_enabled: bool,
    pub sweep_cron: String,
    pub advisory_api_key: Option<String>,
    pub advisory_model: Option<String>,
    pub advisory_url: Option<String>,
    pub web_port: u16,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            utc_offset_hours: -4,
            auto_apply_hours: 24,
            scheduler_enabled: false,
            sweep_cron: "0 * * * * *".to_string(),
            advisory_api_key: None,
            advisory_model: None,
            advisory_url: None,
            web_port: 8788,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl IntakeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("NEXUS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            utc_offset_hours: std::env::var("NEXUS_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.utc_offset_hours),
            auto_apply_hours: std::env::var("NEXUS_AUTO_APPLY_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.auto_apply_hours),
            scheduler_enabled: std::env::var("NEXUS_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            sweep_cron: std::env::var("NEXUS_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            advisory_api_key: non_empty_var("NEXUS_ADVISORY_API_KEY"),
            advisory_model: non_empty_var("NEXUS_ADVISORY_MODEL"),
            advisory_url: non_empty_var("NEXUS_ADVISORY_URL"),
            web_port: std::env::var("NEXUS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .with_context(|| format!("utc offset {}h is out of range", self.utc_offset_hours))
    }

    pub fn ledger_config(&self) -> Result<LedgerConfig> {
        let hours = self.auto_apply_hours;
        ensure!(
            (0..=MAX_AUTO_APPLY_HOURS).contains(&hours),
            "auto-apply delay of {hours}h is outside 0..={MAX_AUTO_APPLY_HOURS}h"
        );
        let auto_apply_delay =
            TimeDelta::try_hours(hours).with_context(|| format!("auto-apply delay of {hours}h"))?;
        Ok(LedgerConfig { auto_apply_delay })
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.workspace_root.join("rules")
    }

    pub fn seed_path(&self) -> PathBuf {
        self.workspace_root.join("fixtures").join("seed.json")
    }
}

/// Scoring and policy tunables, optionally overridden by
/// `rules/scoring.yaml` and `rules/policy.yaml`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub scoring: ScoringConfig,
    pub policy: PolicyConfig,
}

impl RuleSet {
    pub fn from_dir(rules_dir: &Path) -> Result<Self> {
        let scoring_path = rules_dir.join("scoring.yaml");
        let policy_path = rules_dir.join("policy.yaml");
        let scoring = read_optional_yaml(&scoring_path)?;
        validate_scoring(&scoring).with_context(|| format!("invalid {}", scoring_path.display()))?;
        let policy = read_optional_yaml(&policy_path)?;
        validate_policy(&policy).with_context(|| format!("invalid {}", policy_path.display()))?;
        Ok(Self { scoring, policy })
    }

    pub fn validate(&self) -> Result<()> {
        validate_scoring(&self.scoring).context("invalid scoring rules")?;
        validate_policy(&self.policy).context("invalid policy rules")
    }
}

fn ensure_unit(name: &str, value: f64) -> Result<()> {
    ensure!((0.0..=1.0).contains(&value), "{name} must be within [0, 1], got {value}");
    Ok(())
}

fn validate_scoring(scoring: &ScoringConfig) -> Result<()> {
    ensure!(
        scoring.half_life_days.is_finite() && scoring.half_life_days > 0.0,
        "half_life_days must be a positive number, got {}",
        scoring.half_life_days
    );
    ensure!(
        scoring.agreement_window_days.is_finite() && scoring.agreement_window_days > 0.0,
        "agreement_window_days must be a positive number, got {}",
        scoring.agreement_window_days
    );
    ensure!(scoring.agreement_min_sources >= 1, "agreement_min_sources must be at least 1");
    ensure_unit("agreement_boost", scoring.agreement_boost)?;
    let priors = &scoring.priors;
    ensure_unit("priors.debrief", priors.debrief)?;
    ensure_unit("priors.email", priors.email)?;
    ensure_unit("priors.advisory_extraction", priors.advisory_extraction)?;
    ensure_unit("priors.bookmark", priors.bookmark)?;
    ensure_unit("priors.crm", priors.crm)
}

fn validate_policy(policy: &PolicyConfig) -> Result<()> {
    ensure_unit("block_below", policy.block_below)?;
    ensure_unit("high_certainty", policy.high_certainty)?;
    let rules = policy
        .fields
        .iter()
        .map(|(field, rule)| (field.to_string(), rule))
        .chain(std::iter::once(("fallback".to_string(), &policy.fallback)));
    for (name, rule) in rules {
        ensure_unit(&format!("{name} threshold"), rule.threshold)?;
        ensure!(
            policy.block_below <= rule.threshold,
            "{name} threshold {} is below block_below {}",
            rule.threshold,
            policy.block_below
        );
    }
    Ok(())
}

fn read_optional_yaml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn load_seed(config: &IntakeConfig) -> Result<SeedBundle> {
    let path = config.seed_path();
    if path.exists() {
        load_seed_bundle(&path)
    } else {
        Ok(builtin_seed())
    }
}

pub fn extractor_for(config: &IntakeConfig) -> Result<Box<dyn AdvisoryExtractor>> {
    let Some(api_key) = &config.advisory_api_key else {
        info!("advisory extraction disabled; no api key configured");
        return Ok(Box::new(DisabledExtractor));
    };
    let mut advisory = AdvisoryConfig::new(api_key.clone());
    if let Some(model) = &config.advisory_model {
        advisory.model = model.clone();
    }
    if let Some(url) = &config.advisory_url {
        advisory.endpoint = url.clone();
    }
    Ok(Box::new(HttpExtractor::new(advisory)?))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuilderLog {
    pub words: usize,
    pub transcripts: usize,
}

impl BuilderLog {
    pub fn progress_percent(&self) -> usize {
        (self.words * 100 + WORD_TARGET / 2) / WORD_TARGET
    }
}

/// Transcripts answered directly instead of being parsed for evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptCommand {
    WordCount,
    Help,
}

impl TranscriptCommand {
    pub fn detect(transcript: &str) -> Option<Self> {
        let lower = transcript.to_lowercase();
        if lower.contains("word count") || lower.contains("how many words") {
            return Some(TranscriptCommand::WordCount);
        }
        let says_help = lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == "help");
        if says_help || lower.contains("what can you do") {
            return Some(TranscriptCommand::Help);
        }
        None
    }
}

const HELP_TEXT: &str = "Voice commands: \"bookmark that\" saves the last thing said as a task; \
\"what's my word count\" reports progress; anything else is read as a debrief for budget, \
decision maker, stage, meetings and commitments.";

#[derive(Debug, Clone, Serialize)]
pub struct StorytimeOutcome {
    pub insight: String,
    pub command: Option<TranscriptCommand>,
    pub parsed: Option<DebriefParse>,
    pub advisory: Option<AdvisoryExtract>,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookmarkOutcome {
    pub banner: String,
    pub item: TaskItem,
    pub change: Change,
}

/// One-line next step after a debrief.
pub fn actionable_insight(
    advisory: Option<&AdvisoryExtract>,
    stated_budget: Option<&str>,
    proposed_budget: Option<&str>,
) -> String {
    const RESOLVED: &str = "Resolved Today";
    if let Some(advisory) = advisory {
        match advisory.sentiment.as_deref() {
            Some("positive") if stated_budget == Some(RESOLVED) => {
                return "Positive conversation with budget resolved. Follow up with a proposal within 24 hours.".to_string();
            }
            Some("negative") => {
                return "Conversation had a negative tone. Address open concerns before the next meeting.".to_string();
            }
            _ => {}
        }
        if !advisory.key_insights.is_empty() {
            return format!(
                "Key insights: {}. Review and plan follow-up actions.",
                advisory.key_insights.join(", ")
            );
        }
        if !advisory.action_items.is_empty() {
            return format!(
                "Action items identified: {}. Prioritize these tasks.",
                advisory.action_items.join(", ")
            );
        }
    }
    if proposed_budget == Some(RESOLVED) {
        return "Budget likely resolved today → add Agenda Q1 to confirm authority & timing.".to_string();
    }
    "High-signal updates available. Review staged changes and Undo if needed.".to_string()
}

#[derive(Debug, Default)]
struct IntakeState {
    history: BTreeMap<Field, Vec<Arc<Assertion>>>,
    builder_log: BuilderLog,
}

/// Turns transcripts into assertions, resolves each touched field against
/// everything known about it and proposes the results to the ledger.
pub struct IntakePipeline {
    config: IntakeConfig,
    offset: FixedOffset,
    resolver: Resolver,
    ledger: LedgerHandle,
    extractor: Box<dyn AdvisoryExtractor>,
    seed: SeedBundle,
    state: Mutex<IntakeState>,
}

impl IntakePipeline {
    /// Builds an unseeded pipeline; call [`IntakePipeline::reset`] to load
    /// the seed history.
    pub fn new(config: IntakeConfig) -> Result<Self> {
        let offset = config.utc_offset()?;
        let rules = RuleSet::from_dir(&config.rules_dir())?;
        let seed = load_seed(&config)?;
        let extractor = extractor_for(&config)?;
        let ledger = LedgerHandle::new(Ledger::new(
            Some(seed.account.clone()),
            Some(seed.timezone.clone()),
            config.ledger_config()?,
        ));
        Ok(Self {
            config,
            offset,
            resolver: Resolver::new(rules.scoring, rules.policy),
            ledger,
            extractor,
            seed,
            state: Mutex::new(IntakeState::default()),
        })
    }

    pub fn with_extractor(mut self, extractor: Box<dyn AdvisoryExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    pub async fn builder_log(&self) -> BuilderLog {
        self.state.lock().await.builder_log
    }

    /// Everything seen so far for `field`, oldest first.
    pub async fn history(&self, field: Field) -> Vec<Arc<Assertion>> {
        self.state
            .lock()
            .await
            .history
            .get(&field)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn reset(&self) -> Result<Vec<Change>> {
        self.reset_at(Utc::now()).await
    }

    /// Discards all state, reloads the seed history and proposes one
    /// resolved change per seeded field.
    pub async fn reset_at(&self, now: DateTime<Utc>) -> Result<Vec<Change>> {
        let mut state = self.state.lock().await;

        let mut history: BTreeMap<Field, Vec<Arc<Assertion>>> = BTreeMap::new();
        for assertion in self.seed.assertions_at(now)? {
            history
                .entry(assertion.field())
                .or_default()
                .push(Arc::new(assertion));
        }

        let mut ledger = Ledger::new(
            Some(self.seed.account.clone()),
            Some(self.seed.timezone.clone()),
            self.config.ledger_config()?,
        );
        let mut changes = Vec::with_capacity(history.len());
        for (field, evidence) in &history {
            let change = self.resolver.resolve_at(*field, evidence, now)?;
            changes.push(ledger.propose_at(change, now)?);
        }

        self.ledger.replace(ledger).await;
        *state = IntakeState {
            history,
            builder_log: BuilderLog::default(),
        };
        info!(account = %self.seed.account, proposed = changes.len(), "seed loaded");
        Ok(changes)
    }

    pub async fn storytime(&self, transcript: &str) -> Result<StorytimeOutcome> {
        self.storytime_at(transcript, Utc::now()).await
    }

    pub async fn storytime_at(&self, transcript: &str, now: DateTime<Utc>) -> Result<StorytimeOutcome> {
        let words = transcript.split_whitespace().count();
        let span = info_span!("storytime", words);
        self.run_storytime(transcript, words, now).instrument(span).await
    }

    async fn run_storytime(
        &self,
        transcript: &str,
        words: usize,
        now: DateTime<Utc>,
    ) -> Result<StorytimeOutcome> {
        let log = {
            let mut state = self.state.lock().await;
            state.builder_log.words += words;
            state.builder_log.transcripts += 1;
            state.builder_log
        };

        if let Some(command) = TranscriptCommand::detect(transcript) {
            let insight = match command {
                TranscriptCommand::WordCount => format!(
                    "You've logged {} words out of {} ({}% complete).",
                    log.words,
                    WORD_TARGET,
                    log.progress_percent()
                ),
                TranscriptCommand::Help => HELP_TEXT.to_string(),
            };
            info!(?command, "answered transcript command");
            return Ok(StorytimeOutcome {
                insight,
                command: Some(command),
                parsed: None,
                advisory: None,
                changes: Vec::new(),
            });
        }

        let advisory = match self.extractor.extract(transcript).await {
            Ok(extract) => extract,
            Err(err) => {
                warn!(error = %err, "advisory extraction failed; using rule-based parse only");
                None
            }
        };
        let parsed = parse_debrief(transcript, self.offset, now);
        let evidence = debrief_evidence(&parsed, advisory.as_ref(), now);
        let changes = self.ingest(evidence, now).await?;

        let stated_budget = advisory
            .as_ref()
            .and_then(|a| a.budget_status.clone())
            .or_else(|| parsed.budget_status.clone());
        let proposed_budget = match changes.iter().find(|c| c.field == Field::BudgetStatus) {
            Some(change) => change.proposed.as_text().map(str::to_string),
            None => {
                self.ledger
                    .with(|ledger| {
                        ledger
                            .pending()
                            .find(|c| c.field == Field::BudgetStatus)
                            .and_then(|c| c.proposed.as_text().map(str::to_string))
                    })
                    .await
            }
        };
        let insight = actionable_insight(
            advisory.as_ref(),
            stated_budget.as_deref(),
            proposed_budget.as_deref(),
        );
        info!(changes = changes.len(), advisory = advisory.is_some(), "debrief ingested");

        Ok(StorytimeOutcome {
            insight,
            command: None,
            parsed: Some(parsed),
            advisory,
            changes,
        })
    }

    pub async fn bookmark(&self, transcript: &str) -> Result<BookmarkOutcome> {
        self.bookmark_at(transcript, Utc::now()).await
    }

    pub async fn bookmark_at(&self, transcript: &str, now: DateTime<Utc>) -> Result<BookmarkOutcome> {
        let evidence = bookmark_evidence(transcript, self.offset, now);
        let item = match &evidence.assertion().value {
            FieldValue::Task(task) => task.clone(),
            other => anyhow::bail!("bookmark produced a {} value", other.field()),
        };
        let change = self
            .ingest(vec![evidence], now)
            .await?
            .into_iter()
            .next()
            .context("bookmark produced no change")?;
        info!(change_id = %change.id, kind = ?item.kind, "bookmark recorded");
        Ok(BookmarkOutcome {
            banner: format!("{:?} bookmarked", item.kind),
            item,
            change,
        })
    }

    /// Records evidence and proposes the resulting changes. Explicit
    /// commands become one change each; scored evidence re-resolves its
    /// field against the full history, once per touched field. Earlier
    /// pending changes for the same field are left in place, so a staged
    /// change still auto-applies at its deadline even if a later change
    /// for that field was applied first.
    async fn ingest(&self, evidence: Vec<Evidence>, now: DateTime<Utc>) -> Result<Vec<Change>> {
        let mut state = self.state.lock().await;
        let mut changes = Vec::new();
        let mut touched = Vec::new();

        for item in evidence {
            match item {
                Evidence::Explicit { assertion, confidence } => {
                    let assertion = Arc::new(assertion);
                    state
                        .history
                        .entry(assertion.field())
                        .or_default()
                        .push(Arc::clone(&assertion));
                    changes.push(self.resolver.resolve_explicit(assertion, confidence));
                }
                Evidence::Scored(assertion) => {
                    let field = assertion.field();
                    state.history.entry(field).or_default().push(Arc::new(assertion));
                    if !touched.contains(&field) {
                        touched.push(field);
                    }
                }
            }
        }

        for field in touched {
            let evidence = state.history.get(&field).map(Vec::as_slice).unwrap_or_default();
            changes.push(self.resolver.resolve_at(field, evidence, now)?);
        }

        let proposed = self
            .ledger
            .with(|ledger| {
                changes
                    .into_iter()
                    .map(|change| ledger.propose_at(change, now))
                    .collect::<Result<Vec<_>, _>>()
            })
            .await?;
        Ok(proposed)
    }

    pub async fn sweep(&self) -> Vec<Change> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<Change> {
        let promoted = self.ledger.with(|ledger| ledger.expire_deadlines_at(now)).await;
        info!(promoted = promoted.len(), "expiry sweep finished");
        promoted
    }

    /// Cron-driven expiry sweep, when enabled. The caller starts it.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let ledger = self.ledger.clone();
        let cron = &self.config.sweep_cron;
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let ledger = ledger.clone();
            Box::pin(async move {
                let promoted = ledger.expire_deadlines().await;
                if !promoted.is_empty() {
                    info!(promoted = promoted.len(), "scheduled sweep auto-applied changes");
                }
            })
        })
        .with_context(|| format!("creating sweep job for cron {cron}"))?;
        sched.add(job).await.context("adding sweep job")?;
        Ok(Some(sched))
    }
}

/// Pipeline configured from the environment with the seed loaded.
pub async fn pipeline_from_env() -> Result<IntakePipeline> {
    let pipeline = IntakePipeline::new(IntakeConfig::from_env())?;
    pipeline.reset().await?;
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use nexus_advisory::AdvisoryError;
    use nexus_core::{ChangeStatus, Sensitivity, SourceType, TaskKind};

    /// Wednesday 2026-09-16, 10:00 in UTC-4.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 16, 14, 0, 0).single().unwrap()
    }

    fn config_in(root: &Path) -> IntakeConfig {
        IntakeConfig {
            workspace_root: root.to_path_buf(),
            ..IntakeConfig::default()
        }
    }

    async fn seeded(root: &Path) -> IntakePipeline {
        let pipeline = IntakePipeline::new(config_in(root)).unwrap();
        pipeline.reset_at(now()).await.unwrap();
        pipeline
    }

    struct FixedExtractor(AdvisoryExtract);

    #[async_trait]
    impl AdvisoryExtractor for FixedExtractor {
        async fn extract(&self, _transcript: &str) -> Result<Option<AdvisoryExtract>, AdvisoryError> {
            Ok(Some(self.0.clone()))
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl AdvisoryExtractor for FailingExtractor {
        async fn extract(&self, _transcript: &str) -> Result<Option<AdvisoryExtract>, AdvisoryError> {
            Err(AdvisoryError::NoJson)
        }
    }

    const DEBRIEF: &str = "Budget resolved today. Decision maker is David Chen—C-H-E-N. \
                           I'll send the SOC 2 evidence by Friday 5pm.";

    #[test]
    fn flags_and_defaults() {
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("no"));

        let config = IntakeConfig::default();
        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), -4 * 3600);
        assert_eq!(config.ledger_config().unwrap().auto_apply_delay, Duration::hours(24));
        assert!(config.seed_path().ends_with("fixtures/seed.json"));

        let broken = IntakeConfig {
            utc_offset_hours: 30,
            ..IntakeConfig::default()
        };
        assert!(broken.utc_offset().is_err());
    }

    #[test]
    fn rules_fall_back_to_defaults_and_accept_partial_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(RuleSet::from_dir(&dir.path().join("rules")).unwrap(), RuleSet::default());

        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/scoring.yaml"),
            "half_life_days: 30\npriors:\n  crm: 0.15\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("rules/policy.yaml"),
            "block_below: 0.4\nfields:\n  stage:\n    sensitivity: high\n    threshold: 0.9\n",
        )
        .unwrap();

        let rules = RuleSet::from_dir(&dir.path().join("rules")).unwrap();
        assert_eq!(rules.scoring.half_life_days, 30.0);
        assert_eq!(rules.scoring.priors.crm, 0.15);
        assert_eq!(rules.scoring.priors.debrief, 0.40);
        assert_eq!(rules.policy.block_below, 0.4);
        assert_eq!(rules.policy.fields[&Field::Stage].sensitivity, Sensitivity::High);
        assert!(!rules.policy.fields.contains_key(&Field::Tasks));
    }

    #[tokio::test]
    async fn checked_in_rules_and_seed_match_builtins() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        assert_eq!(RuleSet::from_dir(&root.join("rules")).unwrap(), RuleSet::default());

        let pipeline = seeded(&root).await;
        let changes = pipeline.ledger().with(|l| l.snapshot().pending).await;
        assert_eq!(changes.len(), 2);
        assert_eq!(pipeline.history(Field::DecisionMaker).await.len(), 2);
    }

    #[test]
    fn auto_apply_delay_is_bounded() {
        for hours in [-1, MAX_AUTO_APPLY_HOURS + 1, 100_000_000_000] {
            let config = IntakeConfig {
                auto_apply_hours: hours,
                ..IntakeConfig::default()
            };
            assert!(config.ledger_config().is_err(), "{hours}h accepted");
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let err = IntakePipeline::new(IntakeConfig {
            auto_apply_hours: 100_000_000_000,
            ..config_in(dir.path())
        })
        .err()
        .expect("oversized delay rejected");
        assert!(format!("{err:#}").contains("auto-apply delay"));
    }

    #[test]
    fn out_of_range_rules_are_rejected_with_file_name() {
        let cases = [
            ("scoring.yaml", "half_life_days: 0\n"),
            ("scoring.yaml", "agreement_window_days: -5\n"),
            ("scoring.yaml", "priors:\n  email: -0.3\n"),
            ("scoring.yaml", "priors:\n  crm: 1.5\n"),
            ("policy.yaml", "block_below: 0.9\n"),
            ("policy.yaml", "fallback:\n  sensitivity: medium\n  threshold: 1.2\n"),
        ];
        for (file, yaml) in cases {
            let dir = tempfile::tempdir().expect("tempdir");
            let rules_dir = dir.path().join("rules");
            std::fs::create_dir_all(&rules_dir).unwrap();
            std::fs::write(rules_dir.join(file), yaml).unwrap();

            let err = RuleSet::from_dir(&rules_dir).unwrap_err();
            assert!(format!("{err:#}").contains(file), "{yaml} accepted");
        }

        assert!(RuleSet::default().validate().is_ok());
    }

    #[test]
    fn malformed_rules_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(dir.path().join("rules/policy.yaml"), "block_below: [nope").unwrap();
        let err = RuleSet::from_dir(&dir.path().join("rules")).unwrap_err();
        assert!(format!("{err:#}").contains("policy.yaml"));
    }

    #[test]
    fn commands_are_detected_on_words() {
        assert_eq!(
            TranscriptCommand::detect("What's my word count?"),
            Some(TranscriptCommand::WordCount)
        );
        assert_eq!(TranscriptCommand::detect("help"), Some(TranscriptCommand::Help));
        assert_eq!(TranscriptCommand::detect("that was helpful"), None);
    }

    #[test]
    fn insight_prefers_advisory_signal() {
        let negative = AdvisoryExtract {
            sentiment: Some("negative".into()),
            ..AdvisoryExtract::default()
        };
        assert!(actionable_insight(Some(&negative), None, None).contains("negative tone"));

        let insights = AdvisoryExtract {
            key_insights: vec!["SOC 2 gap".into(), "legal review".into()],
            ..AdvisoryExtract::default()
        };
        assert_eq!(
            actionable_insight(Some(&insights), None, None),
            "Key insights: SOC 2 gap, legal review. Review and plan follow-up actions."
        );

        assert!(actionable_insight(None, None, Some("Resolved Today")).contains("Agenda Q1"));
        assert!(actionable_insight(None, None, Some("Freeze")).starts_with("High-signal"));
    }

    #[tokio::test]
    async fn seed_proposes_one_change_per_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = IntakePipeline::new(config_in(dir.path())).unwrap();
        let changes = pipeline.reset_at(now()).await.unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].field, Field::BudgetStatus);
        assert_eq!(changes[0].proposed, FieldValue::BudgetStatus("Freeze".into()));
        assert_eq!(changes[1].proposed, FieldValue::DecisionMaker("David Chan".into()));
        assert!(changes.iter().all(|c| c.status == ChangeStatus::Blocked));

        let snapshot = pipeline.ledger().with(|l| l.snapshot()).await;
        assert_eq!(snapshot.record.account.as_deref(), Some("Acme Robotics"));
        assert_eq!(snapshot.pending.len(), 2);
        assert!(snapshot.record.budget_status.value.is_none());
    }

    #[tokio::test]
    async fn seed_file_replaces_builtin_demo() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();
        std::fs::write(
            dir.path().join("fixtures/seed.json"),
            r#"{"account": "Globex", "timezone": "UTC", "assertions": [
                {"source": "crm", "field": "stage", "value": "Discovery", "age_days": 10}
            ]}"#,
        )
        .unwrap();

        let pipeline = seeded(dir.path()).await;
        let snapshot = pipeline.ledger().with(|l| l.snapshot()).await;
        assert_eq!(snapshot.record.account.as_deref(), Some("Globex"));
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(pipeline.history(Field::Stage).await.len(), 1);
    }

    #[tokio::test]
    async fn debrief_applies_task_and_resolves_against_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = seeded(dir.path()).await;

        let outcome = pipeline.storytime_at(DEBRIEF, now()).await.unwrap();
        assert!(outcome.command.is_none());
        assert!(outcome.advisory.is_none());
        assert_eq!(outcome.changes.len(), 3);

        let task = &outcome.changes[0];
        assert_eq!(task.field, Field::Tasks);
        assert_eq!(task.status, ChangeStatus::AutoApplied);
        assert_eq!(task.confidence, 0.92);

        let budget = &outcome.changes[1];
        assert_eq!(budget.proposed, FieldValue::BudgetStatus("Resolved Today".into()));
        assert_eq!(budget.status, ChangeStatus::Blocked);

        let person = &outcome.changes[2];
        assert_eq!(person.proposed, FieldValue::DecisionMaker("David Chen".into()));
        assert_eq!(person.sensitivity, Sensitivity::High);

        assert!(outcome.insight.contains("Agenda Q1"));
        assert_eq!(pipeline.history(Field::BudgetStatus).await.len(), 3);

        let record = pipeline.ledger().with(|l| l.record().clone()).await;
        assert_eq!(record.tasks.len(), 1);
        assert_eq!(record.tasks[0].title, "Follow-up: SOC 2 evidence");
        assert_eq!(pipeline.builder_log().await.words, 17);
    }

    #[tokio::test]
    async fn corroborated_debrief_is_staged_and_swept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = seeded(dir.path()).await;

        let outcome = pipeline
            .storytime_at("They confirmed the budget freeze on the call.", now())
            .await
            .unwrap();
        let budget = outcome
            .changes
            .iter()
            .find(|c| c.field == Field::BudgetStatus)
            .unwrap();
        assert_eq!(budget.status, ChangeStatus::Staged);
        assert!(budget.confidence > 0.7 && budget.confidence < 0.8);
        assert_eq!(budget.auto_apply_at, Some(now() + Duration::hours(24)));

        assert!(pipeline.sweep_at(now() + Duration::hours(1)).await.is_empty());
        let promoted = pipeline.sweep_at(now() + Duration::hours(25)).await;
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, budget.id);

        let record = pipeline.ledger().with(|l| l.record().clone()).await;
        assert_eq!(record.budget_status.value.as_deref(), Some("Freeze"));
    }

    #[tokio::test]
    async fn out_of_range_seed_age_aborts_reset() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("fixtures")).unwrap();
        std::fs::write(
            dir.path().join("fixtures/seed.json"),
            r#"{"account": "Globex", "timezone": "UTC", "assertions": [
                {"source": "crm", "field": "stage", "value": "Discovery", "age_days": 900000000}
            ]}"#,
        )
        .unwrap();

        let pipeline = IntakePipeline::new(config_in(dir.path())).unwrap();
        let err = pipeline.reset_at(now()).await.unwrap_err();
        assert!(format!("{err:#}").contains("out of range"));
        assert!(pipeline.history(Field::Stage).await.is_empty());
    }

    #[tokio::test]
    async fn earlier_staged_change_still_lands_after_a_later_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = seeded(dir.path()).await;

        let first = pipeline
            .storytime_at("They confirmed the budget freeze on the call.", now())
            .await
            .unwrap();
        let freeze = first
            .changes
            .iter()
            .find(|c| c.field == Field::BudgetStatus)
            .unwrap()
            .clone();
        assert_eq!(freeze.status, ChangeStatus::Staged);

        let budget_change = |outcome: StorytimeOutcome| {
            outcome
                .changes
                .into_iter()
                .find(|c| c.field == Field::BudgetStatus)
                .unwrap()
        };

        // One debrief is not enough to outweigh the corroborated freeze.
        let restaged = budget_change(pipeline.storytime_at("Budget resolved today.", now()).await.unwrap());
        assert_eq!(restaged.proposed, FieldValue::BudgetStatus("Freeze".into()));
        assert_eq!(restaged.status, ChangeStatus::Staged);

        let resolved = budget_change(pipeline.storytime_at("Budget resolved today.", now()).await.unwrap());
        assert_eq!(resolved.proposed, FieldValue::BudgetStatus("Resolved Today".into()));
        assert_eq!(resolved.status, ChangeStatus::AutoApplied);
        assert!(resolved.confidence > freeze.confidence);

        let promoted = pipeline.sweep_at(now() + Duration::hours(25)).await;
        let ids = promoted.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&freeze.id) && ids.contains(&restaged.id));
        let record = pipeline.ledger().with(|l| l.record().clone()).await;
        assert_eq!(record.budget_status.value.as_deref(), Some("Freeze"));
    }

    #[tokio::test]
    async fn advisory_values_are_attributed_and_drive_insight() {
        let dir = tempfile::tempdir().expect("tempdir");
        let extract = AdvisoryExtract {
            budget_status: Some("Approved".into()),
            sentiment: Some("negative".into()),
            ..AdvisoryExtract::default()
        };
        let pipeline = IntakePipeline::new(config_in(dir.path()))
            .unwrap()
            .with_extractor(Box::new(FixedExtractor(extract)));
        pipeline.reset_at(now()).await.unwrap();

        let outcome = pipeline
            .storytime_at("budget resolved, they said", now())
            .await
            .unwrap();
        assert!(outcome.insight.contains("negative tone"));
        assert_eq!(outcome.advisory.unwrap().budget_status.as_deref(), Some("Approved"));

        let history = pipeline.history(Field::BudgetStatus).await;
        let latest = history.last().unwrap();
        assert_eq!(latest.source, SourceType::AdvisoryExtraction);
        assert_eq!(latest.value, FieldValue::BudgetStatus("Approved".into()));
        assert!(!history
            .iter()
            .any(|a| a.value == FieldValue::BudgetStatus("Resolved Today".into())));
    }

    #[tokio::test]
    async fn advisory_failure_degrades_to_rules() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = IntakePipeline::new(config_in(dir.path()))
            .unwrap()
            .with_extractor(Box::new(FailingExtractor));
        pipeline.reset_at(now()).await.unwrap();

        let outcome = pipeline.storytime_at("budget approved", now()).await.unwrap();
        assert!(outcome.advisory.is_none());
        assert_eq!(outcome.parsed.unwrap().budget_status.as_deref(), Some("Approved"));
        assert_eq!(outcome.changes.len(), 1);
    }

    #[tokio::test]
    async fn commands_answer_without_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = seeded(dir.path()).await;

        pipeline.storytime_at("one two three four", now()).await.unwrap();
        let outcome = pipeline
            .storytime_at("what's my word count", now())
            .await
            .unwrap();
        assert_eq!(outcome.command, Some(TranscriptCommand::WordCount));
        assert!(outcome.changes.is_empty());
        assert!(outcome.insight.contains("8 words out of 2000"));

        let help = pipeline.storytime_at("help", now()).await.unwrap();
        assert_eq!(help.command, Some(TranscriptCommand::Help));
        assert_eq!(pipeline.builder_log().await.transcripts, 3);
    }

    #[tokio::test]
    async fn bookmark_auto_applies_a_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = seeded(dir.path()).await;

        let outcome = pipeline
            .bookmark_at("What about SSO pricing? bookmark that", now())
            .await
            .unwrap();
        assert_eq!(outcome.banner, "Question bookmarked");
        assert_eq!(outcome.item.kind, TaskKind::Question);
        assert_eq!(outcome.change.status, ChangeStatus::AutoApplied);
        assert_eq!(outcome.change.confidence, 0.95);

        let record = pipeline.ledger().with(|l| l.record().clone()).await;
        assert_eq!(record.tasks[0].title, "What about SSO pricing?");
    }

    #[tokio::test]
    async fn reset_discards_debrief_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = seeded(dir.path()).await;
        pipeline.storytime_at(DEBRIEF, now()).await.unwrap();

        pipeline.reset_at(now()).await.unwrap();
        let snapshot = pipeline.ledger().with(|l| l.snapshot()).await;
        assert!(snapshot.record.tasks.is_empty());
        assert_eq!(snapshot.pending.len(), 2);
        assert_eq!(pipeline.builder_log().await, BuilderLog::default());
        assert_eq!(pipeline.history(Field::BudgetStatus).await.len(), 2);
    }

    #[tokio::test]
    async fn scheduler_is_opt_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = IntakePipeline::new(config_in(dir.path())).unwrap();
        assert!(pipeline.maybe_build_scheduler().await.unwrap().is_none());

        let enabled = IntakePipeline::new(IntakeConfig {
            scheduler_enabled: true,
            ..config_in(dir.path())
        })
        .unwrap();
        assert!(enabled.maybe_build_scheduler().await.unwrap().is_some());
    }
}
