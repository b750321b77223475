//! Situation nodes of the knowledge base.
//!
//! A situation is a relation between a fixed set of core-argument
//! entities. Its argument set is decided when it is created and cannot
//! change afterwards; only mentions and feature mass accumulate.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::mention::Mention;

/// Stable situation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SituationId(u64);

impl SituationId {
    /// Creates an id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SituationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl From<u64> for SituationId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// A knowledge-base situation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Situation {
    /// Stable id.
    pub id: SituationId,
    /// Owned mentions in link order.
    pub mentions: Vec<Mention>,
    core_arguments: BTreeSet<EntityId>,
    /// Feature weights summed over the mentions.
    pub feature_scores: BTreeMap<String, f64>,
}

impl Situation {
    /// Creates a situation from its first mention.
    #[must_use]
    pub fn new(id: SituationId, core_arguments: BTreeSet<EntityId>, mention: Mention) -> Self {
        let mut situation = Self {
            id,
            mentions: Vec::new(),
            core_arguments,
            feature_scores: BTreeMap::new(),
        };
        situation.add_mention(mention);
        situation
    }

    /// Entities filling the argument slots.
    #[must_use]
    pub const fn core_arguments(&self) -> &BTreeSet<EntityId> {
        &self.core_arguments
    }

    /// Appends a mention and adds its feature weights.
    pub fn add_mention(&mut self, mention: Mention) {
        if let Some(features) = mention.situation_features() {
            for (name, weight) in features {
                *self.feature_scores.entry(name.clone()).or_insert(0.0) += weight;
            }
        }
        self.mentions.push(mention);
    }

    /// `sum_f sqrt(self[f] * mention[f])` over shared features.
    #[must_use]
    pub fn feature_overlap(&self, mention: &Mention) -> f64 {
        let Some(features) = mention.situation_features() else {
            return 0.0;
        };
        features
            .iter()
            .filter_map(|(name, w)| {
                self.feature_scores
                    .get(name)
                    .map(|s| (s * w).max(0.0).sqrt())
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{Sentence, SentenceRef};
    use crate::frequency::ExactFrequency;
    use crate::mention::MentionKey;

    fn predicate(features: &[&str]) -> Mention {
        let s = Sentence::parse_tagged("Smith/NNP/PERSON attacked/VBD/O Jones/NNP/PERSON", 0).unwrap();
        let sref = SentenceRef::new("D1", 0);
        let feats: BTreeSet<String> = features.iter().map(ToString::to_string).collect();
        Mention::situation(
            sref.clone(),
            &s,
            1,
            vec![MentionKey::new(sref.clone(), 0), MentionKey::new(sref, 2)],
            &feats,
            &ExactFrequency::new(10.0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_feature_scores_accumulate() {
        let args: BTreeSet<EntityId> = [EntityId::new(1), EntityId::new(2)].into_iter().collect();
        let mut s = Situation::new(SituationId::new(1), args.clone(), predicate(&["p:attack", "nsubj:attack"]));
        s.add_mention(predicate(&["p:attack"]));
        assert!((s.feature_scores["p:attack"] - 2.0).abs() < 1e-12);
        assert!((s.feature_scores["nsubj:attack"] - 1.0).abs() < 1e-12);
        assert_eq!(s.core_arguments(), &args);
        assert_eq!(s.mentions.len(), 2);
    }

    #[test]
    fn test_feature_overlap() {
        let args: BTreeSet<EntityId> = [EntityId::new(1)].into_iter().collect();
        let mut s = Situation::new(SituationId::new(1), args, predicate(&["a", "b"]));
        s.add_mention(predicate(&["a"]));
        // sqrt(2*1) + sqrt(1*1)
        let overlap = s.feature_overlap(&predicate(&["a", "b", "c"]));
        assert!((overlap - (2f64.sqrt() + 1.0)).abs() < 1e-12);
        assert!(s.feature_overlap(&predicate(&["z"])).abs() < f64::EPSILON);
    }

    #[test]
    fn test_situation_id_display() {
        assert_eq!(SituationId::new(3).to_string(), "s3");
    }
}
