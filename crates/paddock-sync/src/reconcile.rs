//! Change detection between a freshly scraped batch and the seen store.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use paddock_core::{ChangedRecord, Record, RecordError, SeenEntry, SeenStore};
use thiserror::Error;

/// Decides whether a status marks a confirmed (declared) participant.
pub trait ConfirmedStatus: Send + Sync {
    fn is_confirmed(&self, status: &str) -> bool;
}

impl<F> ConfirmedStatus for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_confirmed(&self, status: &str) -> bool {
        self(status)
    }
}

/// Case-insensitive status prefix, e.g. `DP-P` for declared runners.
#[derive(Debug, Clone)]
pub struct StatusPrefix(String);

impl StatusPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into().trim().to_uppercase())
    }
}

impl ConfirmedStatus for StatusPrefix {
    fn is_confirmed(&self, status: &str) -> bool {
        !self.0.is_empty() && status.trim().to_uppercase().starts_with(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverConfirmed;

impl ConfirmedStatus for NeverConfirmed {
    fn is_confirmed(&self, _status: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Report every record as new; the store still records real statuses.
    pub force: bool,
    /// Also surface every confirmed record, known or not.
    pub is_first_of_period: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("batch rejected: {0}")]
    InvalidRecord(#[from] RecordError),
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub new: Vec<Record>,
    pub changed: Vec<ChangedRecord>,
    pub unchanged: Vec<Record>,
    pub confirmed: Vec<Record>,
    pub duplicates_dropped: usize,
    /// The input store with every observed record upserted.
    pub store: SeenStore,
}

impl Reconciliation {
    /// True when a notification is warranted.
    pub fn has_reportable(&self) -> bool {
        !(self.new.is_empty() && self.changed.is_empty() && self.confirmed.is_empty())
    }
}

fn same_status(a: &str, b: &str) -> bool {
    a.split_whitespace().eq(b.split_whitespace())
}

pub struct Reconciler {
    confirmed: Box<dyn ConfirmedStatus>,
}

impl Reconciler {
    pub fn new(confirmed: impl ConfirmedStatus + 'static) -> Self {
        Self {
            confirmed: Box::new(confirmed),
        }
    }

    /// Prefix-based reconciler; `None` means nothing is ever confirmed.
    pub fn with_prefix(prefix: Option<&str>) -> Self {
        match prefix {
            Some(prefix) => Self::new(StatusPrefix::new(prefix)),
            None => Self::new(NeverConfirmed),
        }
    }

    pub fn reconcile(
        &self,
        batch: Vec<Record>,
        mut store: SeenStore,
        options: ReconcileOptions,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, ReconcileError> {
        // Every key is derived before any classification, so one bad record rejects the batch.
        let keys = batch
            .iter()
            .enumerate()
            .map(|(index, record)| {
                record.key().map_err(|field| RecordError::MissingIdentity {
                    index,
                    subject: record.subject.clone(),
                    field,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen_in_batch = HashSet::new();
        let mut deduped = Vec::with_capacity(batch.len());
        let mut duplicates_dropped = 0usize;
        for (key, record) in keys.into_iter().zip(batch) {
            if seen_in_batch.insert(key.clone()) {
                deduped.push((key, record));
            } else {
                duplicates_dropped += 1;
            }
        }

        let mut result = Reconciliation {
            new: Vec::new(),
            changed: Vec::new(),
            unchanged: Vec::new(),
            confirmed: Vec::new(),
            duplicates_dropped,
            store: SeenStore::new(),
        };

        for (key, record) in deduped {
            let previous_status = store.get(&key).map(|entry| entry.status.clone());

            store.upsert(
                key,
                SeenEntry {
                    status: record.status.clone(),
                    last_seen_at: now,
                    metadata: record.metadata.clone(),
                },
            );

            if options.is_first_of_period && self.confirmed.is_confirmed(&record.status) {
                result.confirmed.push(record.clone());
            }

            if options.force {
                result.new.push(record);
                continue;
            }

            match previous_status {
                None => result.new.push(record),
                Some(previous) if !same_status(&previous, &record.status) => {
                    result.changed.push(ChangedRecord {
                        record,
                        previous_status: previous,
                    })
                }
                Some(_) => result.unchanged.push(record),
            }
        }

        result.store = store;
        Ok(result)
    }
}
