//! One sync run: fetch each source's batch, reconcile it against the seen store,
//! notify, persist, and leave a run report behind.

mod reconcile;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use paddock_core::{ChangedRecord, Record};
use paddock_notify::{
    chunk_lines, render_lines, MarkdownFileSink, NotificationSink, StdoutSink,
    DEFAULT_CHUNK_BUDGET,
};
use paddock_sources::{source_for, SourceConfig, SourceRegistry};
use paddock_storage::{
    logical_day, write_atomic, JsonFileSeenStore, PeriodMarkerFile, SeenStoreRepository,
    DEFAULT_STORE_CAP,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use reconcile::{
    ConfirmedStatus, NeverConfirmed, ReconcileError, ReconcileOptions, Reconciler, Reconciliation,
    StatusPrefix,
};

pub const CRATE_NAME: &str = "paddock-sync";

/// Whether the seen store is written before or after notifications go out.
///
/// `BeforeDelivery` never repeats a notification but loses it when delivery
/// fails; `AfterDelivery` keeps it for the next run at the cost of possible repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistOrder {
    BeforeDelivery,
    #[default]
    AfterDelivery,
}

impl FromStr for PersistOrder {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "before" | "before_delivery" => Ok(Self::BeforeDelivery),
            "after" | "after_delivery" => Ok(Self::AfterDelivery),
            other => Err(anyhow!("unknown persist order {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub state_dir: PathBuf,
    pub store_cap: usize,
    pub chunk_budget: usize,
    pub utc_offset_hours: i32,
    pub day_start_hour: u32,
    pub persist_order: PersistOrder,
    pub notify_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            state_dir: PathBuf::from("./state"),
            store_cap: DEFAULT_STORE_CAP,
            chunk_budget: DEFAULT_CHUNK_BUDGET,
            utc_offset_hours: 1,
            day_start_hour: 0,
            persist_order: PersistOrder::default(),
            notify_file: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workspace_root = std::env::var("PADDOCK_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        Self {
            state_dir: std::env::var("PADDOCK_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("state")),
            store_cap: env_parse("PADDOCK_STORE_CAP").unwrap_or(defaults.store_cap),
            chunk_budget: env_parse("PADDOCK_CHUNK_BUDGET").unwrap_or(defaults.chunk_budget),
            utc_offset_hours: env_parse("PADDOCK_UTC_OFFSET_HOURS")
                .unwrap_or(defaults.utc_offset_hours),
            day_start_hour: env_parse("PADDOCK_DAY_START_HOUR").unwrap_or(defaults.day_start_hour),
            persist_order: env_parse("PADDOCK_PERSIST_ORDER").unwrap_or(defaults.persist_order),
            notify_file: std::env::var("PADDOCK_NOTIFY_FILE").ok().map(PathBuf::from),
            workspace_root,
        }
    }

    pub fn store_path(&self, source_id: &str) -> PathBuf {
        self.state_dir.join(format!("{source_id}.seen.json"))
    }

    pub fn period_marker_path(&self, source_id: &str) -> PathBuf {
        self.state_dir.join(format!("{source_id}.period"))
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}

/// Per-invocation switches layered over the configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub force: bool,
    /// Replaces the period-marker decision when set.
    pub first_of_period: Option<bool>,
    pub only_source: Option<String>,
    /// Clock override; defaults to `Utc::now()`.
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub display_name: String,
    pub logical_day: NaiveDate,
    pub first_of_period: bool,
    pub forced: bool,
    pub fetched: usize,
    pub duplicates_dropped: usize,
    pub unchanged: usize,
    pub new: Vec<Record>,
    pub changed: Vec<ChangedRecord>,
    pub confirmed: Vec<Record>,
    pub chunks_delivered: usize,
    pub store_entries: usize,
}

impl SourceOutcome {
    pub fn reportable(&self) -> bool {
        !(self.new.is_empty() && self.changed.is_empty() && self.confirmed.is_empty())
    }
}

/// A source whose sync stopped with an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub persist_order: PersistOrder,
    pub sources: Vec<SourceOutcome>,
    #[serde(default)]
    pub failures: Vec<SourceFailure>,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn total_new(&self) -> usize {
        self.sources.iter().map(|s| s.new.len()).sum()
    }

    pub fn total_changed(&self) -> usize {
        self.sources.iter().map(|s| s.changed.len()).sum()
    }

    pub fn total_confirmed(&self) -> usize {
        self.sources.iter().map(|s| s.confirmed.len()).sum()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    sink: Arc<dyn NotificationSink>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        let sink: Arc<dyn NotificationSink> = match &config.notify_file {
            Some(path) => Arc::new(MarkdownFileSink::new(path.clone())),
            None => Arc::new(StdoutSink),
        };
        Self { config, sink }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Syncs every selected source, then writes the run report.
    ///
    /// A failing source does not stop the others; the report lists it and the
    /// first failure is returned once the report is on disk.
    pub async fn run_once(&self, overrides: RunOverrides) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_source_registry().await?;

        let sources: Vec<&SourceConfig> = match &overrides.only_source {
            Some(source_id) => vec![registry
                .find(source_id)
                .with_context(|| format!("no source named {source_id} in sources.yaml"))?],
            None => registry.enabled().collect(),
        };

        let mut outcomes = Vec::with_capacity(sources.len());
        let mut failures = Vec::new();
        let mut first_error = None;
        for source in sources {
            let span = info_span!("reconcile_source", %run_id, source_id = %source.source_id);
            match self.sync_source(source, &overrides).instrument(span).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    let err = err.context(format!("syncing source {}", source.source_id));
                    let message = format!("{err:#}");
                    warn!(%run_id, source_id = %source.source_id, error = %message, "source sync failed");
                    failures.push(SourceFailure {
                        source_id: source.source_id.clone(),
                        error: message,
                    });
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let finished_at = Utc::now();
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            persist_order: self.config.persist_order,
            sources: outcomes,
            failures,
            reports_dir: String::new(),
        };
        let reports_dir = self.write_reports(&summary).await?;
        summary.reports_dir = reports_dir.display().to_string();

        if let Some(err) = first_error {
            return Err(err.context(format!(
                "{} source(s) failed; report at {}",
                summary.failures.len(),
                summary.reports_dir
            )));
        }

        info!(
            %run_id,
            new = summary.total_new(),
            changed = summary.total_changed(),
            confirmed = summary.total_confirmed(),
            "sync run complete"
        );
        Ok(summary)
    }

    async fn sync_source(
        &self,
        source: &SourceConfig,
        overrides: &RunOverrides,
    ) -> Result<SourceOutcome> {
        let now = overrides.now.unwrap_or_else(Utc::now);
        let record_source = source_for(source, &self.config.workspace_root);
        let batch = record_source.fetch_batch().await?;
        let fetched = batch.len();

        let repository = JsonFileSeenStore::new(self.config.store_path(&source.source_id))
            .with_cap(self.config.store_cap);
        let store = repository.load().await?;

        let marker = PeriodMarkerFile::new(self.config.period_marker_path(&source.source_id));
        let today = logical_day(now, self.config.utc_offset_hours, self.config.day_start_hour)?;
        let first_of_period = match overrides.first_of_period {
            Some(value) => value,
            None => marker.is_first_of_period(today).await?,
        };

        let options = ReconcileOptions {
            force: overrides.force,
            is_first_of_period: first_of_period,
        };
        let reconciliation = Reconciler::with_prefix(source.confirmed_prefix())
            .reconcile(batch, store, options, now)?;
        info!(
            source_id = record_source.source_id(),
            kind = record_source.kind().label(),
            fetched,
            new = reconciliation.new.len(),
            changed = reconciliation.changed.len(),
            unchanged = reconciliation.unchanged.len(),
            confirmed = reconciliation.confirmed.len(),
            duplicates = reconciliation.duplicates_dropped,
            first_of_period,
            "reconciled batch"
        );

        let chunks = chunk_lines(
            &render_lines(
                &source.display_name,
                &reconciliation.new,
                &reconciliation.changed,
                &reconciliation.confirmed,
            ),
            self.config.chunk_budget,
        );

        let chunks_delivered = match self.config.persist_order {
            PersistOrder::BeforeDelivery => {
                repository.save(&reconciliation.store).await?;
                self.deliver(&chunks).await?
            }
            PersistOrder::AfterDelivery => {
                let delivered = self.deliver(&chunks).await?;
                repository.save(&reconciliation.store).await?;
                delivered
            }
        };
        // A forced "not first" answer must not consume the day's first run.
        if overrides.first_of_period.is_none() || first_of_period {
            marker.mark(today).await?;
        }

        Ok(SourceOutcome {
            source_id: source.source_id.clone(),
            display_name: source.display_name.clone(),
            logical_day: today,
            first_of_period,
            forced: overrides.force,
            fetched,
            duplicates_dropped: reconciliation.duplicates_dropped,
            unchanged: reconciliation.unchanged.len(),
            store_entries: reconciliation.store.len().min(repository.cap()),
            new: reconciliation.new,
            changed: reconciliation.changed,
            confirmed: reconciliation.confirmed,
            chunks_delivered,
        })
    }

    async fn deliver(&self, chunks: &[String]) -> Result<usize> {
        if chunks.is_empty() {
            info!("nothing to report; skipping delivery");
            return Ok(0);
        }
        self.sink
            .deliver(chunks)
            .await
            .with_context(|| format!("delivering {} chunk(s) to {}", chunks.len(), self.sink.name()))?;
        Ok(chunks.len())
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        SourceRegistry::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_root().join(summary.run_id.to_string());

        let mut brief = format!(
            "# Paddock Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Persist order: {:?}\n- New: {}\n- Changed: {}\n- Confirmed: {}\n\n## Sources\n{}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.persist_order,
            summary.total_new(),
            summary.total_changed(),
            summary.total_confirmed(),
            summary
                .sources
                .iter()
                .map(|s| format!(
                    "- {} ({}): fetched {}, new {}, changed {}, confirmed {}, unchanged {}, duplicates {}{}",
                    s.source_id,
                    s.logical_day,
                    s.fetched,
                    s.new.len(),
                    s.changed.len(),
                    s.confirmed.len(),
                    s.unchanged,
                    s.duplicates_dropped,
                    if s.first_of_period { ", first run of day" } else { "" }
                ))
                .collect::<Vec<_>>()
                .join("\n")
        );
        if !summary.failures.is_empty() {
            brief.push_str("\n## Failures\n");
            for failure in &summary.failures {
                brief.push_str(&format!("- {}: {}\n", failure.source_id, failure.error));
            }
        }
        write_atomic(&reports_dir.join("run_brief.md"), brief.as_bytes())
            .await
            .context("writing run_brief.md")?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        write_atomic(&reports_dir.join("reconciliation.json"), &json)
            .await
            .context("writing reconciliation.json")?;

        Ok(reports_dir)
    }
}

pub async fn run_sync_once_from_env(overrides: RunOverrides) -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())
        .run_once(overrides)
        .await
}

/// Markdown overview of the `runs` most recent run reports.
pub fn report_recent_runs(runs: usize, config: &SyncConfig) -> Result<String> {
    let reports_root = config.reports_root();
    let mut summaries = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|entry| read_summary(&entry.path().join("reconciliation.json")))
        .collect::<Result<Vec<_>>>()?;
    summaries.sort_by_key(|s| std::cmp::Reverse(s.started_at));

    let mut lines = vec!["# Paddock Recent Runs".to_string(), String::new()];
    for summary in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.started_at));
        for source in &summary.sources {
            lines.push(format!(
                "- {}: new {}, changed {}, confirmed {}, delivered {} chunk(s)",
                source.source_id,
                source.new.len(),
                source.changed.len(),
                source.confirmed.len(),
                source.chunks_delivered
            ));
        }
        for failure in &summary.failures {
            lines.push(format!("- {}: FAILED {}", failure.source_id, failure.error));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn read_summary(path: &Path) -> Result<SyncRunSummary> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Lists the `limit` most recently updated seen entries of a source, newest first.
pub async fn describe_store(config: &SyncConfig, source_id: &str, limit: usize) -> Result<String> {
    if source_id.trim().is_empty() {
        bail!("source id must not be empty");
    }
    let repository = JsonFileSeenStore::new(config.store_path(source_id));
    let store = repository.load().await?;
    let marker = PeriodMarkerFile::new(config.period_marker_path(source_id))
        .load()
        .await?;

    let mut lines = vec![
        format!("store: {}", repository.path().display()),
        format!("entries: {}", store.len()),
        format!(
            "last run day: {}",
            marker.map(|d| d.to_string()).unwrap_or_else(|| "never".into())
        ),
    ];
    let pairs = store.to_pairs();
    for (key, entry) in pairs.iter().rev().take(limit) {
        lines.push(format!("{}  {}  {}", entry.last_seen_at, entry.status, key));
    }
    Ok(lines.join("\n"))
}
