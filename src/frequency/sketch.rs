//! Conservative max/min count sketch.
//!
//! `rows x 2^log_width` buckets. A key maps to one bucket per row; an
//! update raises each of those buckets to `estimate + n`, and a query
//! returns the minimum over rows. Every bucket a key maps to stays at
//! least as large as that key's true count, so the estimate never
//! undercounts. Colliding keys can only inflate each other.
//!
//! Concurrent updates of the *same* key from several threads may lose
//! increments; parallel ingestion should give each pipeline its own
//! sketch and [`SketchFrequency::merge`] them.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crc32fast::Hasher;

use crate::error::{StorageError, ValidationError};
use crate::frequency::{check_smoothing, FrequencyEstimator};
use crate::storage::write_atomic;

/// Magic bytes of sketch checkpoint files.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"PKBS";

const CHECKPOINT_VERSION: u8 = 1;

/// Largest supported `log_width`.
pub const MAX_LOG_WIDTH: u32 = 30;

/// Largest supported number of rows.
pub const MAX_ROWS: usize = 64;

/// Largest bucket count a checkpoint may declare (1 GiB of counters).
pub const MAX_CHECKPOINT_BUCKETS: usize = 1 << 28;

/// Approximate frequency counts in bounded memory.
#[derive(Debug)]
pub struct SketchFrequency {
    rows: usize,
    log_width: u32,
    buckets: Vec<AtomicU32>,
    total: AtomicU64,
    documents: AtomicU64,
    smoothing: f64,
}

fn key_hashes(key: &str) -> (u64, u64) {
    let digest = blake3::hash(key.as_bytes());
    let bytes = digest.as_bytes();
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    a.copy_from_slice(&bytes[0..8]);
    b.copy_from_slice(&bytes[8..16]);
    // Odd step keeps the per-row slots distinct.
    (u64::from_le_bytes(a), u64::from_le_bytes(b) | 1)
}

impl SketchFrequency {
    /// Creates an empty sketch.
    pub fn new(rows: usize, log_width: u32, smoothing: f64) -> Result<Self, ValidationError> {
        if rows == 0 || rows > MAX_ROWS || log_width == 0 || log_width > MAX_LOG_WIDTH {
            return Err(ValidationError::InvalidSketchShape { rows, log_width });
        }
        let smoothing = check_smoothing(smoothing)?;
        let len = rows << log_width;
        let mut buckets = Vec::with_capacity(len);
        buckets.resize_with(len, || AtomicU32::new(0));
        Ok(Self {
            rows,
            log_width,
            buckets,
            total: AtomicU64::new(0),
            documents: AtomicU64::new(0),
            smoothing,
        })
    }

    /// Number of hash rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Base-2 log of the buckets per row.
    #[must_use]
    pub const fn log_width(&self) -> u32 {
        self.log_width
    }

    fn slots(&self, key: &str) -> impl Iterator<Item = usize> + '_ {
        let (h1, h2) = key_hashes(key);
        let mask = (1u64 << self.log_width) - 1;
        (0..self.rows).map(move |row| {
            let pos = h1.wrapping_add((row as u64).wrapping_mul(h2)) & mask;
            #[allow(clippy::cast_possible_truncation)]
            let col = pos as usize;
            (row << self.log_width) + col
        })
    }

    /// Adds `other` bucket-wise, yielding an upper bound of the union of both streams.
    pub fn merge(&self, other: &Self) -> Result<(), ValidationError> {
        if self.rows != other.rows || self.log_width != other.log_width {
            return Err(ValidationError::InvalidSketchShape {
                rows: other.rows,
                log_width: other.log_width,
            });
        }
        for (ours, theirs) in self.buckets.iter().zip(&other.buckets) {
            let add = theirs.load(Ordering::Relaxed);
            let _ = ours.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(add))
            });
        }
        self.total
            .fetch_add(other.total.load(Ordering::Relaxed), Ordering::Relaxed);
        self.documents
            .fetch_add(other.documents.load(Ordering::Relaxed), Ordering::Relaxed);
        Ok(())
    }

    /// Writes a checkpoint.
    ///
    /// Format:
    /// ```text
    /// [magic: 4][version: 1][rows: u32][log_width: u32][smoothing: f64]
    /// [total: u64][documents: u64][buckets: u32 * rows * 2^log_width][crc32: u32]
    /// ```
    /// All integers little-endian; the CRC covers everything after the magic.
    pub fn write_checkpoint(&self, writer: &mut impl Write) -> Result<(), StorageError> {
        if self.buckets.len() > MAX_CHECKPOINT_BUCKETS {
            return Err(StorageError::Serialization {
                message: format!(
                    "sketch of {} buckets exceeds the checkpoint limit of {MAX_CHECKPOINT_BUCKETS}",
                    self.buckets.len()
                ),
            });
        }
        let rows = u32::try_from(self.rows).map_err(|_| StorageError::Serialization {
            message: format!("row count {} does not fit in u32", self.rows),
        })?;
        writer.write_all(&CHECKPOINT_MAGIC)?;

        let mut out = CrcWriter::new(writer);
        out.put(&[CHECKPOINT_VERSION])?;
        out.put(&rows.to_le_bytes())?;
        out.put(&self.log_width.to_le_bytes())?;
        out.put(&self.smoothing.to_le_bytes())?;
        out.put(&self.total.load(Ordering::Relaxed).to_le_bytes())?;
        out.put(&self.documents.load(Ordering::Relaxed).to_le_bytes())?;
        for bucket in &self.buckets {
            out.put(&bucket.load(Ordering::Relaxed).to_le_bytes())?;
        }
        out.finish()?;
        Ok(())
    }

    /// Reads a checkpoint written by [`SketchFrequency::write_checkpoint`].
    pub fn read_checkpoint(reader: &mut impl Read) -> Result<Self, StorageError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != CHECKPOINT_MAGIC {
            return Err(StorageError::Corrupted {
                message: format!("invalid sketch magic: {magic:?}"),
            });
        }

        let mut input = CrcReader::new(reader);
        let mut version = [0u8; 1];
        input.take(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(StorageError::Corrupted {
                message: format!("unsupported sketch version {}", version[0]),
            });
        }
        let rows = input.u32()?;
        let log_width = input.u32()?;
        let smoothing = f64::from_bits(input.u64()?);
        let total = input.u64()?;
        let documents = input.u64()?;

        // The header is untrusted until the CRC is checked; bound the
        // allocation before reading buckets.
        if log_width > MAX_LOG_WIDTH || u64::from(rows) << log_width > MAX_CHECKPOINT_BUCKETS as u64 {
            return Err(StorageError::Corrupted {
                message: format!("sketch header declares {rows}x2^{log_width} buckets"),
            });
        }

        let sketch = Self::new(rows as usize, log_width, smoothing).map_err(|e| StorageError::Corrupted {
            message: e.to_string(),
        })?;
        for bucket in &sketch.buckets {
            bucket.store(input.u32()?, Ordering::Relaxed);
        }
        input.verify()?;

        sketch.total.store(total, Ordering::Relaxed);
        sketch.documents.store(documents, Ordering::Relaxed);
        Ok(sketch)
    }

    /// Writes a checkpoint file atomically (temp file, then rename).
    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        let path = path.as_ref();
        write_atomic(path, |w| self.write_checkpoint(w))?;
        tracing::debug!(path = %path.display(), total = self.total_observations(), "sketch checkpoint written");
        Ok(())
    }

    /// Restores a sketch from a checkpoint file.
    pub fn restore(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        Self::read_checkpoint(&mut reader)
    }
}

struct CrcWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Hasher,
}

impl<'a, W: Write> CrcWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    fn put(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.hasher.update(bytes);
        self.inner.write_all(bytes)
    }

    fn finish(self) -> std::io::Result<()> {
        let crc = self.hasher.finalize();
        self.inner.write_all(&crc.to_le_bytes())?;
        self.inner.flush()
    }
}

struct CrcReader<'a, R: Read> {
    inner: &'a mut R,
    hasher: Hasher,
}

impl<'a, R: Read> CrcReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    fn take(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf)?;
        self.hasher.update(buf);
        Ok(())
    }

    fn u32(&mut self) -> std::io::Result<u32> {
        let mut b = [0u8; 4];
        self.take(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> std::io::Result<u64> {
        let mut b = [0u8; 8];
        self.take(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn verify(self) -> Result<(), StorageError> {
        let computed = self.hasher.finalize();
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b)?;
        let stored = u32::from_le_bytes(b);
        if stored != computed {
            return Err(StorageError::Corrupted {
                message: format!(
                    "CRC mismatch: stored={stored:08x}, computed={computed:08x} (checkpoint corrupted)"
                ),
            });
        }
        Ok(())
    }
}

impl FrequencyEstimator for SketchFrequency {
    fn observe_n(&self, key: &str, n: u64) {
        let target = self.frequency(key).saturating_add(n);
        let target = u32::try_from(target).unwrap_or(u32::MAX);
        for slot in self.slots(key) {
            self.buckets[slot].fetch_max(target, Ordering::Relaxed);
        }
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    fn frequency(&self, key: &str) -> u64 {
        self.slots(key)
            .map(|slot| u64::from(self.buckets[slot].load(Ordering::Relaxed)))
            .min()
            .unwrap_or(0)
    }

    fn total_observations(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn add_document(&self) {
        self.documents.fetch_add(1, Ordering::Relaxed);
    }

    fn num_documents(&self) -> u64 {
        self.documents.load(Ordering::Relaxed)
    }

    fn smoothing(&self) -> f64 {
        self.smoothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    #[test]
    fn test_rejects_bad_shape() {
        assert!(SketchFrequency::new(0, 8, 10.0).is_err());
        assert!(SketchFrequency::new(2, 0, 10.0).is_err());
        assert!(SketchFrequency::new(2, 31, 10.0).is_err());
        assert!(matches!(
            SketchFrequency::new(2, 8, 0.0),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(SketchFrequency::new(2, 8, f64::NAN).is_err());
    }

    fn header(rows: u32, log_width: u32) -> Vec<u8> {
        let mut buf = CHECKPOINT_MAGIC.to_vec();
        buf.push(CHECKPOINT_VERSION);
        buf.extend_from_slice(&rows.to_le_bytes());
        buf.extend_from_slice(&log_width.to_le_bytes());
        buf.extend_from_slice(&10.0f64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf
    }

    #[test]
    fn test_checkpoint_rejects_oversized_header() {
        // Valid shape, but 2^36 buckets and no bucket data behind it.
        let buf = header(64, 30);
        assert_eq!(buf.len(), 37);
        let err = SketchFrequency::read_checkpoint(&mut Cursor::new(buf));
        assert!(matches!(err, Err(StorageError::Corrupted { .. })));

        let err = SketchFrequency::read_checkpoint(&mut Cursor::new(header(u32::MAX, 63)));
        assert!(matches!(err, Err(StorageError::Corrupted { .. })));

        // Within the limit, a truncated body is an I/O error, not an abort.
        let err = SketchFrequency::read_checkpoint(&mut Cursor::new(header(2, 4)));
        assert!(matches!(err, Err(StorageError::Io(_))));
    }

    #[test]
    fn test_never_undercounts_under_collisions() {
        // 16 buckets per row against 500 keys forces heavy collisions.
        let sketch = SketchFrequency::new(2, 4, 10.0).unwrap();
        let mut truth: HashMap<String, u64> = HashMap::new();
        let mut last: HashMap<String, u64> = HashMap::new();
        for i in 0..5000u64 {
            let key = format!("k{}", (i * 7919) % 500);
            sketch.observe(&key);
            *truth.entry(key.clone()).or_insert(0) += 1;
            let f = sketch.frequency(&key);
            assert!(f >= truth[&key]);
            if let Some(prev) = last.insert(key, f) {
                assert!(f >= prev);
            }
        }
        for (key, count) in &truth {
            assert!(sketch.frequency(key) >= *count);
        }
        assert_eq!(sketch.total_observations(), 5000);
    }

    #[test]
    fn test_exact_without_collisions() {
        let sketch = SketchFrequency::new(4, 16, 10.0).unwrap();
        sketch.observe_n("h:Smith", 3);
        sketch.observe("h:Smith");
        assert_eq!(sketch.frequency("h:Smith"), 4);
        assert_eq!(sketch.frequency("never-seen"), 0);
    }

    #[test]
    fn test_merge_is_upper_bound() {
        let a = SketchFrequency::new(2, 8, 10.0).unwrap();
        let b = SketchFrequency::new(2, 8, 10.0).unwrap();
        a.observe_n("x", 2);
        b.observe_n("x", 5);
        b.observe("y");
        a.merge(&b).unwrap();
        assert!(a.frequency("x") >= 7);
        assert!(a.frequency("y") >= 1);
        assert_eq!(a.total_observations(), 8);

        let c = SketchFrequency::new(3, 8, 10.0).unwrap();
        assert!(a.merge(&c).is_err());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let sketch = SketchFrequency::new(2, 6, 10.0).unwrap();
        for i in 0..50 {
            sketch.observe_n(&format!("f{i}"), i);
        }
        sketch.add_document();

        let mut buf = Vec::new();
        sketch.write_checkpoint(&mut buf).unwrap();
        let back = SketchFrequency::read_checkpoint(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.rows(), 2);
        assert_eq!(back.log_width(), 6);
        assert_eq!(back.num_documents(), 1);
        assert_eq!(back.total_observations(), sketch.total_observations());
        for i in 0..50 {
            let key = format!("f{i}");
            assert_eq!(back.frequency(&key), sketch.frequency(&key));
        }
    }

    #[test]
    fn test_checkpoint_detects_corruption() {
        let sketch = SketchFrequency::new(1, 4, 10.0).unwrap();
        sketch.observe("a");
        let mut buf = Vec::new();
        sketch.write_checkpoint(&mut buf).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        let err = SketchFrequency::read_checkpoint(&mut Cursor::new(buf));
        assert!(matches!(err, Err(StorageError::Corrupted { .. })));
    }

    #[test]
    fn test_checkpoint_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freq.sketch");
        let sketch = SketchFrequency::new(2, 8, 10.0).unwrap();
        sketch.observe_n("pi:paris", 9);
        sketch.checkpoint(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let back = SketchFrequency::restore(&path).unwrap();
        assert_eq!(back.frequency("pi:paris"), 9);
    }
}
