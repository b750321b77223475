//! Entity nodes of the knowledge base.
//!
//! An entity owns the mentions linked to it and aggregates the term
//! vectors of their source documents for document-level similarity.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collab::DocumentId;
use crate::feature::{self, Feat};
use crate::mention::Mention;
use crate::termvec::TermVector;

/// Stable entity identifier.
///
/// Ids are allocated sequentially by the knowledge base so identical
/// runs produce identical ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
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

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// A knowledge-base entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable id.
    pub id: EntityId,
    /// Owned mentions in link order.
    pub mentions: Vec<Mention>,
    /// Term counts summed over the distinct source documents.
    pub context: TermVector,
    /// Documents already folded into `context`.
    pub context_documents: BTreeSet<DocumentId>,
    /// Why this entity matters, e.g. `seed`.
    pub relevance: Vec<Feat>,
}

impl Entity {
    /// Creates an entity from its first mention.
    #[must_use]
    pub fn new(id: EntityId, mention: Mention, document_terms: &TermVector) -> Self {
        let mut entity = Self {
            id,
            mentions: Vec::new(),
            context: TermVector::new(),
            context_documents: BTreeSet::new(),
            relevance: Vec::new(),
        };
        entity.add_mention(mention, document_terms);
        entity
    }

    /// Appends a mention, folding its document into the context once.
    pub fn add_mention(&mut self, mention: Mention, document_terms: &TermVector) {
        if self.context_documents.insert(mention.document().clone()) {
            self.context.add(document_terms);
        }
        self.mentions.push(mention);
    }

    /// Records a relevance reason.
    pub fn add_relevance(&mut self, name: impl Into<String>, weight: f64) {
        self.relevance.push(Feat::new(name, weight));
    }

    /// Sum of relevance weights.
    #[must_use]
    pub fn relevance_score(&self) -> f64 {
        feature::sum(&self.relevance)
    }

    /// Union of the mentions' triage features.
    #[must_use]
    pub fn triage_features(&self) -> BTreeSet<String> {
        self.mentions
            .iter()
            .flat_map(|m| m.triage_features.iter().cloned())
            .collect()
    }

    /// Attribute features of all mentions, keeping the largest weight.
    #[must_use]
    pub fn attribute_features(&self) -> BTreeMap<String, f64> {
        let mut out: BTreeMap<String, f64> = BTreeMap::new();
        for (name, weight) in self.mentions.iter().flat_map(|m| &m.attribute_features) {
            let slot = out.entry(name.clone()).or_insert(*weight);
            *slot = slot.max(*weight);
        }
        out
    }

    /// Longest surface form among the mentions.
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        self.mentions
            .iter()
            .map(|m| m.span_text.as_str())
            .max_by_key(|s| s.len())
            .unwrap_or("")
    }
}
