//! Named, weighted score components.
//!
//! Every score in pkbp is kept as a list of `Feat`s rather than a bare
//! scalar so that link decisions can be audited and tested per component.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One named component of a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feat {
    /// Component name.
    pub name: String,
    /// Contribution to the total.
    pub weight: f64,
}

impl Feat {
    /// Creates a component.
    #[must_use]
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

impl fmt::Display for Feat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:.3}", self.name, self.weight)
    }
}

/// Sum of all component weights.
#[must_use]
pub fn sum(feats: &[Feat]) -> f64 {
    feats.iter().map(|f| f.weight).sum()
}

/// Weight of the first component named `name`.
#[must_use]
pub fn find(feats: &[Feat], name: &str) -> Option<f64> {
    feats.iter().find(|f| f.name == name).map(|f| f.weight)
}

/// Renders components for logging, largest magnitude first.
#[must_use]
pub fn describe(feats: &[Feat]) -> String {
    let mut sorted: Vec<&Feat> = feats.iter().collect();
    sorted.sort_by(|a, b| b.weight.abs().total_cmp(&a.weight.abs()));
    sorted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_and_find() {
        let feats = vec![Feat::new("intercept", -1.0), Feat::new("cosine", 0.25)];
        assert!((sum(&feats) + 0.75).abs() < 1e-12);
        assert_eq!(find(&feats, "cosine"), Some(0.25));
        assert_eq!(find(&feats, "missing"), None);
        assert!(sum(&[]).abs() < f64::EPSILON);
    }

    #[test]
    fn test_describe_orders_by_magnitude() {
        let feats = vec![Feat::new("small", 0.1), Feat::new("big", -3.0)];
        assert_eq!(describe(&feats), "big:-3.000 small:0.100");
    }
}
