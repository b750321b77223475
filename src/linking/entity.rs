//! Entity linking: scores a candidate entity mention against every
//! entity of the knowledge base.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{LinkingConfig, PkbConfig, SearchConfig};
use crate::entity::{Entity, EntityId};
use crate::feature::{self, Feat};
use crate::frequency::FrequencyEstimator;
use crate::mention::{Mention, MentionKey};
use crate::registry::Pkb;
use crate::termvec::{tfidf_cosine, TermVector};

/// Target of an entity link proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityTarget {
    /// Add the mention to an existing entity.
    Existing(EntityId),
    /// Create a new entity from the mention.
    New,
}

/// A scored entity link proposal. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct EntLink {
    /// Mention being linked.
    pub source: MentionKey,
    /// Proposed target.
    pub target: EntityTarget,
    /// Named score components.
    pub score: Vec<Feat>,
}

impl EntLink {
    /// Sum of the score components.
    #[must_use]
    pub fn total(&self) -> f64 {
        feature::sum(&self.score)
    }

    /// Returns true for new-entity proposals.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self.target, EntityTarget::New)
    }
}

/// Summed specificity of the features two mentions share.
#[must_use]
pub fn triage_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>, freq: &dyn FrequencyEstimator) -> f64 {
    a.intersection(b).map(|f| freq.score(f)).sum()
}

/// Average query weight over the attribute features both sides carry.
#[must_use]
pub fn attribute_overlap(query: &BTreeMap<String, f64>, candidate: &BTreeMap<String, f64>) -> f64 {
    let shared: Vec<f64> = query
        .iter()
        .filter(|(name, _)| candidate.contains_key(*name))
        .map(|(_, w)| *w)
        .collect();
    if shared.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = shared.len() as f64;
    shared.iter().sum::<f64>() / n
}

/// Scores entity mentions against a knowledge base snapshot.
pub struct EntityLinker<'a> {
    pkb: &'a Pkb,
    freq: &'a dyn FrequencyEstimator,
    search: &'a SearchConfig,
    linking: &'a LinkingConfig,
    seed_terms: Option<&'a TermVector>,
}

impl<'a> EntityLinker<'a> {
    /// Creates a linker. `seed_terms` is the seed document's term vector,
    /// used by [`EntityLinker::interestingness`].
    #[must_use]
    pub fn new(
        pkb: &'a Pkb,
        freq: &'a dyn FrequencyEstimator,
        config: &'a PkbConfig,
        seed_terms: Option<&'a TermVector>,
    ) -> Self {
        Self {
            pkb,
            freq,
            search: &config.search,
            linking: &config.linking,
            seed_terms,
        }
    }

    /// Document cosine between an entity and a mention, dampened for
    /// same-document matches.
    #[must_use]
    pub fn entity_cosine(&self, entity: &Entity, mention: &Mention, mention_terms: &TermVector) -> f64 {
        let cos = tfidf_cosine(&entity.context, mention_terms, self.freq);
        if cos > self.search.same_document_trigger || entity.context_documents.contains(mention.document()) {
            cos.min(self.search.same_document_cosine)
        } else {
            cos
        }
    }

    /// Link score components of `mention` against `entity`.
    #[must_use]
    pub fn score_entity(&self, entity: &Entity, mention: &Mention, mention_terms: &TermVector) -> Vec<Feat> {
        let cos = self.entity_cosine(entity, mention, mention_terms);

        let mut total = 0.0;
        let mut max: f64 = 0.0;
        let mut attr = 0.0;
        for m in &entity.mentions {
            let s = triage_overlap(&m.triage_features, &mention.triage_features, self.freq);
            total += s;
            max = max.max(s);
            attr += attribute_overlap(&m.attribute_features, &mention.attribute_features);
        }
        #[allow(clippy::cast_precision_loss)]
        let avg = if entity.mentions.is_empty() {
            0.0
        } else {
            total / entity.mentions.len() as f64
        };

        vec![
            Feat::new("tfidfCosine", 0.25 * (cos - 0.5)),
            Feat::new("triageFeatsAvg", 6.0 * avg),
            Feat::new("triageFeatsMax", 3.0 * max),
            Feat::new("triageFeatsAvgTfIdf", 40.0 * (0.1 + cos) * avg),
            Feat::new("triageFeatsMaxTfIdf", 20.0 * (0.1 + cos) * max),
            Feat::new("attrFeat", (attr + 1.0).sqrt() - 1.0),
        ]
    }

    /// Proposals for `mention`: the best existing link (if any entity
    /// exists) followed by the new-entity proposal.
    #[must_use]
    pub fn propose(&self, mention: &Mention, mention_terms: &TermVector) -> Vec<EntLink> {
        let mut best: Option<(EntityId, Vec<Feat>, f64)> = None;
        for entity in self.pkb.entities() {
            let score = self.score_entity(entity, mention, mention_terms);
            let total = feature::sum(&score);
            if best.as_ref().map_or(true, |(_, _, b)| total > *b) {
                best = Some((entity.id, score, total));
            }
        }

        let mut new_score = vec![Feat::new("intercept", self.linking.new_entity_bias)];
        let mut out = Vec::with_capacity(2);
        if let Some((id, score, total)) = best {
            new_score.push(Feat::new("competingLinkIsGood", (-total).min(0.0)));
            out.push(EntLink {
                source: mention.key.clone(),
                target: EntityTarget::Existing(id),
                score,
            });
        }
        out.push(EntLink {
            source: mention.key.clone(),
            target: EntityTarget::New,
            score: new_score,
        });
        out
    }

    /// Interestingness components of a mention: type prior, rarity of its
    /// triage features and similarity to the seed document.
    #[must_use]
    pub fn interestingness(&self, mention: &Mention, mention_terms: &TermVector) -> Vec<Feat> {
        let ner = mention.ner_type().unwrap_or("O");
        let mut out = vec![Feat::new(format!("ner={ner}"), self.linking.ner_prior(ner))];

        let precision = self.triage_precision(mention);
        let word_freq = if precision > 0.0 {
            let k = self.freq.smoothing();
            (k + 1.0) / (k + 1.0 / precision)
        } else {
            0.0
        };
        out.push(Feat::new("wordFreq", word_freq));

        let seed_cos = self
            .seed_terms
            .map_or(0.0, |seed| tfidf_cosine(seed, mention_terms, self.freq));
        out.push(Feat::new(
            "tfidfWithSeed",
            self.linking.seed_similarity_weight * seed_cos,
        ));
        out
    }

    /// Summed specificity of the mention's rarest triage features.
    fn triage_precision(&self, mention: &Mention) -> f64 {
        let mut feats: Vec<(u64, &String)> = mention
            .triage_features
            .iter()
            .map(|f| (self.freq.frequency(f), f))
            .collect();
        feats.sort();

        let n = feats.len();
        let mut precision = 0.0;
        for (i, (frequency, _)) in feats.iter().enumerate() {
            let p = crate::frequency::specificity(*frequency, self.freq.smoothing());
            precision += p;
            let remaining = n - (i + 1);
            #[allow(clippy::cast_precision_loss)]
            let rest = p * remaining as f64;
            if rest < self.linking.word_freq_tolerance || i + 1 >= self.linking.max_word_freq_features {
                break;
            }
        }
        precision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ArgumentHead, ParsedDocument, SentenceRef, TokenSpan};
    use crate::frequency::ExactFrequency;
    use crate::registry::{CommitBatch, EntityAction};

    fn doc(id: &str, line: &str) -> ParsedDocument {
        ParsedDocument::from_tagged(id, &[line]).unwrap()
    }

    fn jane(d: &ParsedDocument) -> Mention {
        Mention::entity(
            SentenceRef::new(d.id.clone(), 0),
            &d.sentences[0],
            ArgumentHead { head: 1, span: TokenSpan::new(0, 2) },
            None,
        )
        .unwrap()
    }

    fn corpus() -> ExactFrequency {
        let freq = ExactFrequency::new(10.0).unwrap();
        for _ in 0..100 {
            freq.add_document();
        }
        for t in ["jane", "smith", "visited", "paris", "today", "praised", "loudly"] {
            freq.observe_n(t, 10);
        }
        freq
    }

    fn pkb_with(d: &ParsedDocument) -> Pkb {
        let mut pkb = Pkb::new();
        pkb.apply(CommitBatch {
            entities: vec![EntityAction::Create {
                mention: jane(d),
                document_terms: TermVector::from_document(d),
                relevance: Vec::new(),
            }],
            situations: Vec::new(),
        })
        .unwrap();
        pkb
    }

    #[test]
    fn test_empty_pkb_only_proposes_new() {
        let pkb = Pkb::new();
        let freq = corpus();
        let config = PkbConfig::default();
        let linker = EntityLinker::new(&pkb, &freq, &config, None);
        let d = doc("D1", "Jane/NNP/PERSON Smith/NNP/PERSON visited/VBD/O");
        let links = linker.propose(&jane(&d), &TermVector::from_document(&d));
        assert_eq!(links.len(), 1);
        assert!(links[0].is_new());
        assert!((links[0].total() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cross_document_link_score() {
        let freq = corpus();
        let config = PkbConfig::default();
        let d1 = doc("D1", "Jane/NNP/PERSON Smith/NNP/PERSON visited/VBD/O Paris/NNP/GPE today/NN/O");
        let d2 = doc("D2", "Jane/NNP/PERSON Smith/NNP/PERSON praised/VBD/O Paris/NNP/GPE loudly/RB/O");
        let pkb = pkb_with(&d1);
        let linker = EntityLinker::new(&pkb, &freq, &config, None);

        let m2 = jane(&d2);
        let terms = TermVector::from_document(&d2);
        let entity = pkb.entities().next().unwrap();
        assert!((linker.entity_cosine(entity, &m2, &terms) - 0.6).abs() < 1e-9);

        let links = linker.propose(&m2, &terms);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].target, EntityTarget::Existing(entity.id));
        assert!(links[0].total() > config.linking.entity_link_threshold);
        assert!(links[0].total() > links[1].total());
        assert!(feature::find(&links[1].score, "competingLinkIsGood").unwrap() < 0.0);
    }

    #[test]
    fn test_same_document_cosine_dampened() {
        let freq = corpus();
        let config = PkbConfig::default();
        let d1 = doc("D1", "Jane/NNP/PERSON Smith/NNP/PERSON visited/VBD/O Paris/NNP/GPE today/NN/O");
        let pkb = pkb_with(&d1);
        let linker = EntityLinker::new(&pkb, &freq, &config, None);
        let entity = pkb.entities().next().unwrap();
        let cos = linker.entity_cosine(entity, &jane(&d1), &TermVector::from_document(&d1));
        assert!((cos - config.search.same_document_cosine).abs() < 1e-12);
    }

    #[test]
    fn test_interestingness_components() {
        let freq = corpus();
        let config = PkbConfig::default();
        let pkb = Pkb::new();
        let d1 = doc("D1", "Jane/NNP/PERSON Smith/NNP/PERSON visited/VBD/O Paris/NNP/GPE today/NN/O");
        let seed = TermVector::from_document(&d1);
        let linker = EntityLinker::new(&pkb, &freq, &config, Some(&seed));
        let feats = linker.interestingness(&jane(&d1), &seed);
        assert_eq!(feature::find(&feats, "ner=PERSON"), Some(0.5));
        // Four unseen triage features, each with specificity 1.
        let wf = feature::find(&feats, "wordFreq").unwrap();
        assert!((wf - 11.0 / 10.25).abs() < 1e-12);
        assert!((feature::find(&feats, "tfidfWithSeed").unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_overlap_helpers() {
        let freq = ExactFrequency::new(10.0).unwrap();
        let a: BTreeSet<String> = ["h:A", "pi:a"].iter().map(ToString::to_string).collect();
        let b: BTreeSet<String> = ["h:A", "pi:b"].iter().map(ToString::to_string).collect();
        assert!((triage_overlap(&a, &b, &freq) - 1.0).abs() < 1e-12);

        let q: BTreeMap<String, f64> = [("x".to_string(), 2.0), ("y".to_string(), 0.4)].into_iter().collect();
        let c: BTreeMap<String, f64> = [("x".to_string(), 1.0)].into_iter().collect();
        assert!((attribute_overlap(&q, &c) - 2.0).abs() < 1e-12);
        assert!(attribute_overlap(&q, &BTreeMap::new()).abs() < f64::EPSILON);
    }
}
