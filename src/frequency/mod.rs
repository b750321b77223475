//! Frequency estimation for feature rarity.
//!
//! A [`FrequencyEstimator`] answers "how often has this key been seen".
//! Every backend guarantees `frequency(k) >= true count of k`, so scores
//! derived from it can only underestimate rarity, never overestimate it.
//!
//! Backends:
//! - [`ExactFrequency`]: a map of exact counts with a line-oriented log format.
//! - [`SketchFrequency`]: a fixed-size max/min sketch for corpora that do not
//!   fit in memory.
//!
//! [`ReversibleHashWriter`] is the companion that maps hashed ids back to
//! the strings they came from.

pub mod exact;
pub mod reversible;
pub mod sketch;

use std::collections::HashSet;

use crate::error::ValidationError;

pub use exact::ExactFrequency;
pub use reversible::{hash32, read_log, ReversibleHashWriter};
pub use sketch::SketchFrequency;

/// Specificity of a key observed `frequency` times: `(k+1)/(k+f)`.
///
/// Frequencies are floored to 1 so the result stays in `(0, 1]`.
#[must_use]
pub fn specificity(frequency: u64, k: f64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let f = frequency.max(1) as f64;
    (k + 1.0) / (k + f)
}

/// Checks a smoothing constant `k`, which must be finite and positive.
pub(crate) fn check_smoothing(k: f64) -> Result<f64, ValidationError> {
    if k.is_finite() && k > 0.0 {
        Ok(k)
    } else {
        Err(ValidationError::OutOfRange {
            field: "smoothing".to_string(),
            value: k,
            reason: "must be finite and greater than 0".to_string(),
        })
    }
}

/// Counts string occurrences, exactly or as a conservative upper bound.
///
/// Methods take `&self`: backends use interior mutability so an ingestion
/// pipeline can keep observing while scorers read. Readers must tolerate
/// counts that grow between two calls.
pub trait FrequencyEstimator: Send + Sync {
    /// Records `n` occurrences of `key`.
    fn observe_n(&self, key: &str, n: u64);

    /// Records one occurrence of `key`.
    fn observe(&self, key: &str) {
        self.observe_n(key, 1);
    }

    /// Upper bound of the number of times `key` was observed.
    fn frequency(&self, key: &str) -> u64;

    /// Total number of observations across all keys.
    fn total_observations(&self) -> u64;

    /// Records that one more document has been seen.
    fn add_document(&self);

    /// Number of documents recorded.
    fn num_documents(&self) -> u64;

    /// Smoothing constant `k` used by [`FrequencyEstimator::score`].
    fn smoothing(&self) -> f64;

    /// Records a document and observes each distinct term once, making
    /// `frequency` a document frequency for those terms.
    fn record_document(&self, terms: &[&str]) {
        self.add_document();
        let mut distinct = HashSet::with_capacity(terms.len());
        for term in terms {
            if distinct.insert(*term) {
                self.observe(term);
            }
        }
    }

    /// Specificity score in `(0, 1]`, decreasing in frequency.
    fn score(&self, key: &str) -> f64 {
        specificity(self.frequency(key), self.smoothing())
    }

    /// Inverse document frequency `ln(numDocs / freq)`, floored at zero.
    fn idf(&self, key: &str) -> f64 {
        let docs = self.num_documents();
        if docs == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = docs as f64 / self.frequency(key).max(1) as f64;
        ratio.ln().max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specificity_bounds() {
        assert!((specificity(0, 10.0) - 1.0).abs() < 1e-12);
        assert!((specificity(1, 10.0) - 1.0).abs() < 1e-12);
        let s = specificity(u64::MAX, 10.0);
        assert!(s > 0.0 && s < 1e-10);
    }

    #[test]
    fn test_specificity_strictly_decreasing() {
        let mut prev = specificity(1, 10.0);
        for f in 2..500 {
            let s = specificity(f, 10.0);
            assert!(s < prev, "score must drop from f={} to f={}", f - 1, f);
            assert!(s > 0.0 && s <= 1.0);
            prev = s;
        }
    }

    #[test]
    fn test_idf_defaults() {
        let est = ExactFrequency::new(10.0).unwrap();
        assert!(est.idf("anything").abs() < f64::EPSILON);

        for _ in 0..10 {
            est.add_document();
        }
        est.observe_n("common", 10);
        assert!(est.idf("common").abs() < 1e-12);
        assert!((est.idf("unseen") - 10f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_record_document_counts_distinct_terms() {
        let est = ExactFrequency::new(10.0).unwrap();
        est.record_document(&["a", "b", "a"]);
        est.record_document(&["a"]);
        assert_eq!(est.num_documents(), 2);
        assert_eq!(est.frequency("a"), 2);
        assert_eq!(est.frequency("b"), 1);
    }
}
