//! Record source contracts: the registry of scraped tables and JSON batch loading.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paddock_core::{validate_records, Record, RecordError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "paddock-sources";

/// Status prefix the federation uses for declared runners.
pub const DECLARED_RUNNER_PREFIX: &str = "DP-P";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Engagements,
    Results,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Engagements => "Engagements",
            Self::Results => "Results",
        }
    }

    /// Prefix marking a confirmed status when the registry does not override it.
    pub fn default_confirmed_prefix(self) -> Option<&'static str> {
        match self {
            Self::Engagements => Some(DECLARED_RUNNER_PREFIX),
            Self::Results => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    /// Batch file written by the scraper, relative to the workspace root.
    pub batch_path: PathBuf,
    #[serde(default)]
    pub confirmed_prefix: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn confirmed_prefix(&self) -> Option<&str> {
        self.confirmed_prefix
            .as_deref()
            .or_else(|| self.kind.default_confirmed_prefix())
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("batch from {source_id} rejected")]
    Invalid {
        source_id: String,
        #[source]
        error: RecordError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One scraper output: either a bare list of records or a wrapped batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchFile {
    Wrapped(RecordBatch),
    Bare(Vec<Record>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordBatch {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    pub records: Vec<Record>,
}

impl BatchFile {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Self::Wrapped(batch) => batch.records,
            Self::Bare(records) => records,
        }
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Fetches the current batch, already checked against the identity precondition.
    async fn fetch_batch(&self) -> Result<Vec<Record>, SourceError>;
}

/// Reads the JSON batch a scraper run left on disk.
#[derive(Debug, Clone)]
pub struct JsonBatchSource {
    source_id: String,
    kind: SourceKind,
    path: PathBuf,
}

impl JsonBatchSource {
    pub fn new(source_id: impl Into<String>, kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSource for JsonBatchSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch_batch(&self) -> Result<Vec<Record>, SourceError> {
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let records = parse_batch(&data)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        validate_batch(&self.source_id, &records)?;
        debug!(source_id = %self.source_id, records = records.len(), "loaded batch");
        Ok(records)
    }
}

pub fn parse_batch(text: &str) -> anyhow::Result<Vec<Record>> {
    let batch: BatchFile = serde_json::from_str(text)?;
    Ok(batch.into_records())
}

/// Rejects the whole batch when any record lacks its identity fields.
pub fn validate_batch(source_id: &str, records: &[Record]) -> Result<(), SourceError> {
    validate_records(records).map_err(|error| SourceError::Invalid {
        source_id: source_id.to_string(),
        error,
    })
}

pub fn source_for(config: &SourceConfig, workspace_root: &Path) -> Box<dyn RecordSource> {
    Box::new(JsonBatchSource::new(
        config.source_id.clone(),
        config.kind,
        workspace_root.join(&config.batch_path),
    ))
}
