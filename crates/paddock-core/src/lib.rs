//! Core domain model for Paddock: scraped records, identity keys and the seen store.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "paddock-core";

/// Separator between normalized identity fragments inside a key.
pub const KEY_SEPARATOR: &str = "|";

/// One scraped table row (an engagement or a result line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Record {
    pub subject: String,
    pub date: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub extra: String,
    #[serde(default)]
    pub status: String,
    /// Passthrough values (detail URLs, race numbers) carried into the store untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Record {
    pub fn new(
        subject: impl Into<String>,
        date: impl Into<String>,
        location: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            date: date.into(),
            location: location.into(),
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Checks the identity precondition: subject, date and one of location/event.
    pub fn check_identity(&self) -> Result<(), IdentityField> {
        if normalize_text(&self.subject).is_empty() {
            return Err(IdentityField::Subject);
        }
        if normalize_text(&self.date).is_empty() {
            return Err(IdentityField::Date);
        }
        if normalize_text(&self.location).is_empty() && normalize_text(&self.event).is_empty() {
            return Err(IdentityField::LocationOrEvent);
        }
        Ok(())
    }

    /// Derives the deduplication key from the identity fields.
    pub fn key(&self) -> Result<RecordKey, IdentityField> {
        self.check_identity()?;
        let key = [
            &self.subject,
            &self.date,
            &self.location,
            &self.event,
            &self.extra,
        ]
        .iter()
        .map(|field| normalize_text(field))
        .collect::<Vec<_>>()
        .join(KEY_SEPARATOR);
        Ok(RecordKey(key))
    }
}

/// A record whose status moved since the previous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedRecord {
    pub record: Record,
    pub previous_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    Subject,
    Date,
    LocationOrEvent,
}

impl std::fmt::Display for IdentityField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Subject => "subject",
            Self::Date => "date",
            Self::LocationOrEvent => "location/event",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record #{index} ({subject:?}) is missing its {field}")]
    MissingIdentity {
        index: usize,
        subject: String,
        field: IdentityField,
    },
}

/// Returns the first record in `records` that violates the identity precondition.
pub fn validate_records(records: &[Record]) -> Result<(), RecordError> {
    for (index, record) in records.iter().enumerate() {
        record
            .check_identity()
            .map_err(|field| RecordError::MissingIdentity {
                index,
                subject: record.subject.clone(),
                field,
            })?;
    }
    Ok(())
}

/// Normalized identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_apostrophe(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201B}' | '\u{02BC}' | '\u{02B9}' | '\u{2032}' | '\u{00B4}'
        | '`' => '\'',
        other => other,
    }
}

/// Collapses whitespace, trims, canonicalizes apostrophes and lowercases.
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .map(canonical_apostrophe)
        .collect::<String>()
        .to_lowercase()
}

/// Last known state of a key, as persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenEntry {
    pub status: String,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Key → last seen state, ordered by most recent upsert.
///
/// Every upsert moves its key to the newest end, so truncating from the
/// oldest end evicts in FIFO update order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenStore {
    entries: HashMap<RecordKey, (u64, SeenEntry)>,
    order: BTreeMap<u64, RecordKey>,
    next_seq: u64,
}

impl SeenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&SeenEntry> {
        self.entries.get(key).map(|(_, entry)| entry)
    }

    /// Inserts or refreshes `key`, moving it to the most recent position.
    ///
    /// `last_seen_at` never moves backwards: an older timestamp keeps the stored one.
    pub fn upsert(&mut self, key: RecordKey, mut entry: SeenEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some((old_seq, previous)) = self.entries.remove(&key) {
            self.order.remove(&old_seq);
            if previous.last_seen_at > entry.last_seen_at {
                entry.last_seen_at = previous.last_seen_at;
            }
        }
        self.order.insert(seq, key.clone());
        self.entries.insert(key, (seq, entry));
    }

    /// Keeps the `cap` most recently upserted entries, dropping the oldest first.
    pub fn truncate_to_recent(&mut self, cap: usize) -> usize {
        let excess = self.len().saturating_sub(cap);
        for _ in 0..excess {
            if let Some((_, key)) = self.order.pop_first() {
                self.entries.remove(&key);
            }
        }
        excess
    }

    /// Entries from oldest to most recent update.
    pub fn iter(&self) -> impl Iterator<Item = (&RecordKey, &SeenEntry)> + '_ {
        self.order.values().filter_map(move |key| {
            self.entries.get(key).map(|(_, entry)| (key, entry))
        })
    }

    pub fn to_pairs(&self) -> Vec<(RecordKey, SeenEntry)> {
        self.iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (RecordKey, SeenEntry)>) -> Self {
        let mut store = Self::new();
        for (key, entry) in pairs {
            store.upsert(key, entry);
        }
        store
    }
}
