//! Notification rendering, size-bounded chunking and delivery sinks.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use paddock_core::{ChangedRecord, Record};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

pub const CRATE_NAME: &str = "paddock-notify";

/// Default per-message budget, under the usual 2000 character chat limit.
pub const DEFAULT_CHUNK_BUDGET: usize = 1900;

/// Metadata entry appended to a rendered line when present.
pub const URL_METADATA_KEY: &str = "url";

fn describe(record: &Record) -> String {
    let mut parts = vec![record.subject.trim(), record.date.trim()];
    for part in [&record.location, &record.event, &record.extra] {
        let part = part.trim();
        if !part.is_empty() {
            parts.push(part);
        }
    }
    let mut line = parts.join(" · ");
    if let Some(url) = record.metadata.get(URL_METADATA_KEY) {
        line.push_str(&format!(" <{url}>"));
    }
    line
}

fn status_or_dash(status: &str) -> &str {
    let status = status.trim();
    if status.is_empty() {
        "-"
    } else {
        status
    }
}

/// One line per record: new, then changed (`OLD → NEW`), then confirmed.
pub fn render_lines(
    label: &str,
    new: &[Record],
    changed: &[ChangedRecord],
    confirmed: &[Record],
) -> Vec<String> {
    let mut lines = Vec::with_capacity(new.len() + changed.len() + confirmed.len());
    for record in new {
        lines.push(format!(
            "🆕 [{label}] {} : {}",
            describe(record),
            status_or_dash(&record.status)
        ));
    }
    for item in changed {
        lines.push(format!(
            "🔄 [{label}] {} : {} → {}",
            describe(&item.record),
            status_or_dash(&item.previous_status),
            status_or_dash(&item.record.status)
        ));
    }
    for record in confirmed {
        lines.push(format!(
            "✅ [{label}] {} : {}",
            describe(record),
            status_or_dash(&record.status)
        ));
    }
    lines
}

/// Greedily packs `lines` into newline-joined chunks of at most `budget` characters.
///
/// Lines are never split; a line longer than the budget travels alone.
pub fn chunk_lines<S: AsRef<str>>(lines: &[S], budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for line in lines {
        let line = line.as_ref();
        let line_len = line.chars().count();
        let joined_len = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };

        if !current.is_empty() && joined_len > budget {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Destination for rendered chunks.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers chunks in order; an error leaves later chunks undelivered.
    async fn deliver(&self, chunks: &[String]) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl NotificationSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn deliver(&self, chunks: &[String]) -> anyhow::Result<()> {
        let mut out = tokio::io::stdout();
        for chunk in chunks {
            out.write_all(chunk.as_bytes())
                .await
                .context("writing chunk to stdout")?;
            out.write_all(b"\n\n").await.context("writing chunk to stdout")?;
        }
        out.flush().await.context("flushing stdout")?;
        Ok(())
    }
}

/// Appends each delivery as a timestamped section of a markdown document.
#[derive(Debug, Clone)]
pub struct MarkdownFileSink {
    path: PathBuf,
}

impl MarkdownFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NotificationSink for MarkdownFileSink {
    fn name(&self) -> &str {
        "markdown-file"
    }

    async fn deliver(&self, chunks: &[String]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;

        let mut section = format!("## {}\n\n", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
        for chunk in chunks {
            section.push_str(chunk);
            section.push_str("\n\n");
        }
        file.write_all(section.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", self.path.display()))?;
        info!(path = %self.path.display(), chunks = chunks.len(), "appended notification");
        Ok(())
    }
}

/// Keeps every delivered chunk in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<String>>,
    fail_with: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every delivery fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            fail_with: Some(message.into()),
        }
    }

    pub async fn delivered(&self) -> Vec<String> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, chunks: &[String]) -> anyhow::Result<()> {
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{message}");
        }
        self.delivered.lock().await.extend(chunks.iter().cloned());
        Ok(())
    }
}
