//! Reversible string hashing.
//!
//! Sketch buckets only remember hashes. [`ReversibleHashWriter`] assigns a
//! 32-bit id to each string and appends an `id\tstring` line the first
//! time the id is seen, so a hashed feature can later be mapped back to
//! text with [`read_log`].
//!
//! Deduplication is approximate: ids are remembered in a bounded
//! recent/common pair of tables. An evicted id is simply logged again,
//! which is harmless; an id is never logged with the wrong string.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

/// Stable 32-bit id of a string.
#[must_use]
pub fn hash32(s: &str) -> u32 {
    let digest = blake3::hash(s.as_bytes());
    let b = digest.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Appends `id\tstring` lines for strings not seen recently.
#[derive(Debug)]
pub struct ReversibleHashWriter<W: Write> {
    out: W,
    recent: HashMap<u32, u32>,
    common: HashMap<u32, u32>,
    recent_limit: usize,
    common_limit: usize,
    decay: u32,
    lines_written: u64,
    hits: u64,
    compactions: u64,
}

impl<W: Write> ReversibleHashWriter<W> {
    /// Creates a writer with the given tier limits.
    pub fn new(out: W, recent_limit: usize, common_limit: usize, decay: u32) -> Self {
        Self {
            out,
            recent: HashMap::new(),
            common: HashMap::new(),
            recent_limit: recent_limit.max(1),
            common_limit: common_limit.max(1),
            decay,
            lines_written: 0,
            hits: 0,
            compactions: 0,
        }
    }

    /// Returns the id of `s`, logging it if it is not remembered.
    ///
    /// Tabs and newlines in `s` are written as spaces so every record
    /// stays on one line.
    pub fn write(&mut self, s: &str) -> io::Result<u32> {
        let id = hash32(s);
        if let Some(count) = self.recent.get_mut(&id).or_else(|| self.common.get_mut(&id)) {
            *count = count.saturating_add(1);
            self.hits += 1;
            return Ok(id);
        }

        let clean: String = s
            .chars()
            .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        writeln!(self.out, "{id}\t{clean}")?;
        self.lines_written += 1;
        self.recent.insert(id, 1);
        if self.recent.len() > self.recent_limit {
            self.compact();
        }
        Ok(id)
    }

    /// Merges the recent tier into the common tier and trims the latter.
    pub fn compact(&mut self) {
        for (id, count) in self.recent.drain() {
            let slot = self.common.entry(id).or_insert(0);
            *slot = slot.saturating_add(count);
        }
        if self.common.len() > self.common_limit {
            let mut entries: Vec<(u32, u32)> = self.common.drain().collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            entries.truncate(self.common_limit);
            let decay = self.decay;
            self.common = entries
                .into_iter()
                .map(|(id, c)| (id, c.saturating_sub(decay).max(1)))
                .collect();
        }
        self.compactions += 1;
        tracing::debug!(
            common = self.common.len(),
            lines = self.lines_written,
            "reversible hash compacted"
        );
    }

    /// Lines appended so far.
    #[must_use]
    pub const fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Writes that were deduplicated.
    #[must_use]
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    /// Compactions performed.
    #[must_use]
    pub const fn compactions(&self) -> u64 {
        self.compactions
    }

    /// Ids currently remembered across both tiers.
    #[must_use]
    pub fn remembered(&self) -> usize {
        self.recent.len() + self.common.len()
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads an `id\tstring` log back into a lookup table.
///
/// Malformed lines are skipped; the first string logged for an id wins.
pub fn read_log(reader: impl BufRead) -> io::Result<HashMap<u32, String>> {
    let mut out = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let Some((id, s)) = line.split_once('\t') else {
            continue;
        };
        if let Ok(id) = id.parse::<u32>() {
            out.entry(id).or_insert_with(|| s.to_string());
        }
    }
    Ok(out)
}
