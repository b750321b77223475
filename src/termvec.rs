//! Document term vectors and tf-idf cosine similarity.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::collab::ParsedDocument;
use crate::frequency::FrequencyEstimator;

static TERM: OnceLock<Option<Regex>> = OnceLock::new();

/// Returns true for tokens that count as document terms.
///
/// Punctuation and symbol-only tokens are excluded.
#[must_use]
pub fn is_term(token: &str) -> bool {
    let re = TERM.get_or_init(|| Regex::new(r"[\p{L}\p{N}]").ok());
    match re {
        Some(re) => re.is_match(token),
        None => token.chars().any(char::is_alphanumeric),
    }
}

/// Term counts of one or more documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermVector {
    counts: BTreeMap<String, u32>,
    total: u64,
}

impl TermVector {
    /// Creates an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a vector from raw terms, skipping non-terms.
    pub fn from_terms<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut v = Self::new();
        for term in terms {
            v.add_term(term.as_ref());
        }
        v
    }

    /// Term vector of a whole document (lowercased words).
    #[must_use]
    pub fn from_document(doc: &ParsedDocument) -> Self {
        Self::from_terms(doc.words())
    }

    /// Adds one occurrence of `term` if it is a term.
    pub fn add_term(&mut self, term: &str) {
        if !is_term(term) {
            return;
        }
        let slot = self.counts.entry(term.to_string()).or_insert(0);
        *slot = slot.saturating_add(1);
        self.total += 1;
    }

    /// Adds all counts of `other`.
    pub fn add(&mut self, other: &Self) {
        for (term, count) in &other.counts {
            let slot = self.counts.entry(term.clone()).or_insert(0);
            *slot = slot.saturating_add(*count);
        }
        self.total += other.total;
    }

    /// Count of `term`.
    #[must_use]
    pub fn count(&self, term: &str) -> u32 {
        self.counts.get(term).copied().unwrap_or(0)
    }

    /// Number of distinct terms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if no term was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Total term occurrences.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Distinct terms in sorted order.
    pub fn terms(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }
}

/// Cosine between two term vectors weighted by `tf * sqrt(idf)`.
///
/// Term frequencies are normalized by vector length; idf comes from
/// `freq`. Returns 0 when either side has no weighted term.
#[must_use]
pub fn tfidf_cosine(a: &TermVector, b: &TermVector, freq: &dyn FrequencyEstimator) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let weights = |v: &TermVector| -> BTreeMap<String, f64> {
        #[allow(clippy::cast_precision_loss)]
        let total = v.total.max(1) as f64;
        v.counts
            .iter()
            .map(|(t, c)| (t.clone(), f64::from(*c) / total * freq.idf(t).sqrt()))
            .collect()
    };
    let wa = weights(a);
    let wb = weights(b);

    let norm = |w: &BTreeMap<String, f64>| w.values().map(|x| x * x).sum::<f64>().sqrt();
    let (na, nb) = (norm(&wa), norm(&wb));
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    let dot: f64 = wa
        .iter()
        .filter_map(|(t, x)| wb.get(t).map(|y| x * y))
        .sum();
    let sim = dot / (na * nb);
    if sim.is_finite() {
        sim.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frequency::ExactFrequency;

    fn uniform_idf(terms: &[&str]) -> ExactFrequency {
        let est = ExactFrequency::new(10.0).unwrap();
        for _ in 0..100 {
            est.add_document();
        }
        for t in terms {
            est.observe_n(t, 10);
        }
        est
    }

    #[test]
    fn test_from_terms_skips_punctuation() {
        let v = TermVector::from_terms(["jane", ",", "smith", "jane", "."]);
        assert_eq!(v.len(), 2);
        assert_eq!(v.count("jane"), 2);
        assert_eq!(v.total(), 3);
    }

    #[test]
    fn test_cosine_identical_is_one() {
        let est = uniform_idf(&["a", "b"]);
        let v = TermVector::from_terms(["a", "b"]);
        assert!((tfidf_cosine(&v, &v, &est) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_partial_overlap() {
        let terms = ["jane", "smith", "visited", "paris", "today", "praised", "loudly"];
        let est = uniform_idf(&terms);
        let d1 = TermVector::from_terms(["jane", "smith", "visited", "paris", "today"]);
        let d2 = TermVector::from_terms(["jane", "smith", "praised", "paris", "loudly"]);
        assert!((tfidf_cosine(&d1, &d2, &est) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_disjoint_and_empty() {
        let est = uniform_idf(&["a", "b"]);
        let a = TermVector::from_terms(["a"]);
        let b = TermVector::from_terms(["b"]);
        assert!(tfidf_cosine(&a, &b, &est).abs() < f64::EPSILON);
        assert!(tfidf_cosine(&a, &TermVector::new(), &est).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cosine_ignores_ubiquitous_terms() {
        let est = ExactFrequency::new(10.0).unwrap();
        for _ in 0..10 {
            est.record_document(&["the"]);
        }
        let a = TermVector::from_terms(["the"]);
        assert!(tfidf_cosine(&a, &a, &est).abs() < f64::EPSILON);
    }

    #[test]
    fn test_add() {
        let mut a = TermVector::from_terms(["x"]);
        a.add(&TermVector::from_terms(["x", "y"]));
        assert_eq!(a.count("x"), 2);
        assert_eq!(a.count("y"), 1);
        assert_eq!(a.total(), 3);
    }
}
