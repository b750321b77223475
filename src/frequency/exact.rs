//! Exact in-memory frequency counts.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::{PoisonError, RwLock};

use crate::error::{PkbError, StorageError, ValidationError};
use crate::frequency::{check_smoothing, FrequencyEstimator};

const DOCS_TAG: &str = "numDocs";

#[derive(Debug, Default, Clone)]
struct ExactState {
    counts: HashMap<String, u64>,
    total: u64,
    documents: u64,
}

/// Exact string counts.
///
/// On disk the counts are a line log: a `numDocs\t<n>` header followed by
/// one `count\tkey` line per key. Keys must not contain newlines.
#[derive(Debug)]
pub struct ExactFrequency {
    state: RwLock<ExactState>,
    smoothing: f64,
}

impl ExactFrequency {
    /// Creates an empty estimator.
    ///
    /// # Errors
    /// Rejects a smoothing constant that is not finite and positive.
    pub fn new(smoothing: f64) -> Result<Self, ValidationError> {
        Ok(Self {
            state: RwLock::new(ExactState::default()),
            smoothing: check_smoothing(smoothing)?,
        })
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).counts.len()
    }

    /// Returns true if nothing was observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds all counts of `other` into this estimator.
    pub fn merge(&self, other: &Self) {
        let theirs = other.state.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut ours = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for (key, count) in theirs.counts {
            let slot = ours.counts.entry(key).or_insert(0);
            *slot = slot.saturating_add(count);
        }
        ours.total = ours.total.saturating_add(theirs.total);
        ours.documents = ours.documents.saturating_add(theirs.documents);
    }

    /// Writes the line log, keys in sorted order.
    pub fn save(&self, mut writer: impl Write) -> Result<(), StorageError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{DOCS_TAG}\t{}", state.documents)?;
        let mut entries: Vec<(&String, &u64)> = state.counts.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (key, count) in entries {
            writeln!(writer, "{count}\t{key}")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a line log written by [`ExactFrequency::save`].
    pub fn load(reader: impl BufRead, smoothing: f64) -> Result<Self, PkbError> {
        let mut freq = Self::new(smoothing)?;
        *freq.state.get_mut().unwrap_or_else(PoisonError::into_inner) = read_log_state(reader)?;
        Ok(freq)
    }

    /// Keys ordered by descending count, ties by key.
    #[must_use]
    pub fn most_common(&self, limit: usize) -> Vec<(String, u64)> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, u64)> =
            state.counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries
    }
}

fn read_log_state(reader: impl BufRead) -> Result<ExactState, StorageError> {
    let mut state = ExactState::default();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let Some((left, right)) = line.split_once('\t') else {
            return Err(StorageError::Corrupted {
                message: format!("line {}: missing tab separator", lineno + 1),
            });
        };
        if lineno == 0 && left == DOCS_TAG {
            state.documents = right.parse().map_err(|_| StorageError::Corrupted {
                message: format!("line 1: bad document count '{right}'"),
            })?;
            continue;
        }
        let count: u64 = left.parse().map_err(|_| StorageError::Corrupted {
            message: format!("line {}: bad count '{left}'", lineno + 1),
        })?;
        let slot = state.counts.entry(right.to_string()).or_insert(0);
        *slot = slot.saturating_add(count);
        state.total = state.total.saturating_add(count);
    }
    Ok(state)
}

impl FrequencyEstimator for ExactFrequency {
    fn observe_n(&self, key: &str, n: u64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let slot = state.counts.entry(key.to_string()).or_insert(0);
        *slot = slot.saturating_add(n);
        state.total = state.total.saturating_add(n);
    }

    fn frequency(&self, key: &str) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .counts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn total_observations(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).total
    }

    fn add_document(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.documents = state.documents.saturating_add(1);
    }

    fn num_documents(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).documents
    }

    fn smoothing(&self) -> f64 {
        self.smoothing
    }
}
