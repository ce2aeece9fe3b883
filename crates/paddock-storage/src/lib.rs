//! Seen-store persistence, period markers and atomic file writes for Paddock.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use paddock_core::{RecordKey, SeenEntry, SeenStore};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "paddock-storage";

/// Default number of entries kept in a seen store file.
pub const DEFAULT_STORE_CAP: usize = 5000;

const PERIOD_DATE_FORMAT: &str = "%Y-%m-%d";

/// Write `bytes` to `path` through a temp file in the same directory and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Load/save contract the sync pipeline uses around the reconciler.
#[async_trait]
pub trait SeenStoreRepository: Send + Sync {
    async fn load(&self) -> anyhow::Result<SeenStore>;

    /// Persists `store`, keeping only the most recently updated entries up to the cap.
    async fn save(&self, store: &SeenStore) -> anyhow::Result<()>;
}

/// Seen store persisted as a JSON list of `[key, entry]` pairs, most recent last.
#[derive(Debug, Clone)]
pub struct JsonFileSeenStore {
    path: PathBuf,
    cap: usize,
}

impl JsonFileSeenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cap: DEFAULT_STORE_CAP,
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

#[async_trait]
impl SeenStoreRepository for JsonFileSeenStore {
    async fn load(&self) -> anyhow::Result<SeenStore> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking store path {}", self.path.display()))?
        {
            debug!(path = %self.path.display(), "no seen store yet; starting empty");
            return Ok(SeenStore::new());
        }

        let data = fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        match serde_json::from_slice::<Vec<(RecordKey, SeenEntry)>>(&data) {
            Ok(pairs) => Ok(SeenStore::from_pairs(pairs)),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "seen store is unreadable; treating it as empty"
                );
                Ok(SeenStore::new())
            }
        }
    }

    async fn save(&self, store: &SeenStore) -> anyhow::Result<()> {
        let mut capped = store.clone();
        let evicted = capped.truncate_to_recent(self.cap);
        if evicted > 0 {
            debug!(evicted, cap = self.cap, "evicted oldest seen entries");
        }
        let bytes = serde_json::to_vec_pretty(&capped.to_pairs())
            .context("serializing seen store")?;
        write_atomic(&self.path, &bytes).await
    }
}

/// Seen store kept in memory; useful for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemorySeenStore {
    cap: Option<usize>,
    inner: Mutex<SeenStore>,
}

impl InMemorySeenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: Some(cap),
            inner: Mutex::new(SeenStore::new()),
        }
    }

    pub async fn snapshot(&self) -> SeenStore {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl SeenStoreRepository for InMemorySeenStore {
    async fn load(&self) -> anyhow::Result<SeenStore> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, store: &SeenStore) -> anyhow::Result<()> {
        let mut capped = store.clone();
        if let Some(cap) = self.cap {
            capped.truncate_to_recent(cap);
        }
        *self.inner.lock().await = capped;
        Ok(())
    }
}

/// Maps `now` to its logical day: shifted to the local offset, then back by the day start hour.
pub fn logical_day(
    now: DateTime<Utc>,
    utc_offset_hours: i32,
    day_start_hour: u32,
) -> anyhow::Result<NaiveDate> {
    let offset = utc_offset_hours
        .checked_mul(3600)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| anyhow!("utc offset {utc_offset_hours}h is out of range"))?;
    if day_start_hour > 23 {
        return Err(anyhow!("day start hour {day_start_hour} is out of range"));
    }
    let local = now.with_timezone(&offset) - Duration::hours(i64::from(day_start_hour));
    Ok(local.date_naive())
}

/// Remembers the last logical day a run completed.
#[derive(Debug, Clone)]
pub struct PeriodMarkerFile {
    path: PathBuf,
}

impl PeriodMarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<Option<NaiveDate>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking marker path {}", self.path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        match NaiveDate::parse_from_str(text.trim(), PERIOD_DATE_FORMAT) {
            Ok(day) => Ok(Some(day)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring malformed period marker");
                Ok(None)
            }
        }
    }

    pub async fn is_first_of_period(&self, today: NaiveDate) -> anyhow::Result<bool> {
        Ok(self.load().await? != Some(today))
    }

    pub async fn mark(&self, today: NaiveDate) -> anyhow::Result<()> {
        let text = format!("{}\n", today.format(PERIOD_DATE_FORMAT));
        write_atomic(&self.path, text.as_bytes()).await
    }
}
