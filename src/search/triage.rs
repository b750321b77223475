//! Two-stage triage retrieval.
//!
//! Stage 1 ranks sentences by how many query triage features hit them,
//! with diminishing returns. Stage 2 re-ranks the top of that list by
//! contextual evidence: the best named-entity run of each sentence is
//! scored by triage overlap, attribute-feature overlap and document
//! cosine against the query context.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::collab::{DocumentId, FeatureIndex, ParsedDocument, SentenceRef, TokenSpan};
use crate::config::SearchConfig;
use crate::entity::Entity;
use crate::error::CollaboratorError;
use crate::feature::Feat;
use crate::fetch::DocumentFetcher;
use crate::frequency::FrequencyEstimator;
use crate::linking::{attribute_overlap, triage_overlap};
use crate::mention::{attribute_features, triage_features};
use crate::termvec::{tfidf_cosine, TermVector};

/// What to search for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriageQuery {
    /// Exact-match retrieval features.
    pub triage_features: BTreeSet<String>,
    /// Re-ranking features with weights.
    pub attribute_features: BTreeMap<String, f64>,
    /// Term vector of the query documents.
    pub context: TermVector,
    /// Documents the context was built from.
    pub context_documents: BTreeSet<DocumentId>,
}

impl TriageQuery {
    /// Query covering the mentions of all `entities`.
    #[must_use]
    pub fn for_entities(entities: &[&Entity]) -> Self {
        let mut query = Self::default();
        for entity in entities {
            query.triage_features.extend(entity.triage_features());
            for (name, weight) in entity.attribute_features() {
                let slot = query.attribute_features.entry(name).or_insert(weight);
                *slot = slot.max(weight);
            }
            query.context.add(&entity.context);
            query
                .context_documents
                .extend(entity.context_documents.iter().cloned());
        }
        query
    }
}

/// Stage-1 hit list entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceHit {
    /// Sentence hit.
    pub sentence: SentenceRef,
    /// `n * 2/(1+n)` for `n` distinct matching features.
    pub score: f64,
    /// Best specificity among the matching features.
    pub tie_break: f64,
    /// Matching features.
    pub matched: Vec<String>,
}

/// A re-ranked candidate mention.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Sentence containing the mention.
    pub sentence: SentenceRef,
    /// Head token of the best-matching named-entity run.
    pub head: usize,
    /// Span of that run.
    pub span: TokenSpan,
    /// Stage-1 score.
    pub stage1: f64,
    /// Stage-2 score.
    pub score: f64,
    /// Stage-2 components.
    pub components: Vec<Feat>,
    /// Query features that hit the sentence.
    pub matched: Vec<String>,
}

/// Everything a triage search produced.
#[derive(Debug, Default)]
pub struct TriageOutcome {
    /// Candidates, best first.
    pub candidates: Vec<Candidate>,
    /// Documents fetched for stage 2.
    pub documents: BTreeMap<DocumentId, Arc<ParsedDocument>>,
    /// Term vectors of the fetched documents.
    pub terms: BTreeMap<DocumentId, TermVector>,
    /// Sentences dropped because their document could not be read.
    pub failed_sentences: Vec<(SentenceRef, CollaboratorError)>,
    /// Features whose index lookup failed.
    pub index_failures: Vec<(String, CollaboratorError)>,
    /// Retrieved sentences with no named-entity run to score.
    pub without_mentions: Vec<SentenceRef>,
}

impl TriageOutcome {
    /// Total collaborator failures.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failed_sentences.len() + self.index_failures.len()
    }
}

/// Triage search over a feature index.
pub struct TriageSearch<'a> {
    index: &'a dyn FeatureIndex,
    fetcher: &'a DocumentFetcher,
    freq: &'a dyn FrequencyEstimator,
    config: &'a SearchConfig,
}

impl<'a> TriageSearch<'a> {
    /// Creates a search over the given collaborators.
    #[must_use]
    pub fn new(
        index: &'a dyn FeatureIndex,
        fetcher: &'a DocumentFetcher,
        freq: &'a dyn FrequencyEstimator,
        config: &'a SearchConfig,
    ) -> Self {
        Self {
            index,
            fetcher,
            freq,
            config,
        }
    }

    /// Stage 1: coarse ranking of every sentence hit by a feature.
    pub fn stage1(&self, features: &BTreeSet<String>) -> (Vec<SentenceHit>, Vec<(String, CollaboratorError)>) {
        let keys: Vec<String> = features.iter().cloned().collect();
        let mut matched: BTreeMap<SentenceRef, BTreeSet<String>> = BTreeMap::new();
        let mut failures = Vec::new();
        for (feature, result) in self.index.lookup_batch(&keys) {
            match result {
                Ok(hits) => {
                    for sentence in hits {
                        matched.entry(sentence).or_default().insert(feature.clone());
                    }
                }
                Err(e) => {
                    warn!(feature = %feature, error = %e, "feature lookup failed");
                    failures.push((feature, e));
                }
            }
        }

        let mut hits: Vec<SentenceHit> = matched
            .into_iter()
            .map(|(sentence, feats)| {
                #[allow(clippy::cast_precision_loss)]
                let n = feats.len() as f64;
                let tie_break = feats
                    .iter()
                    .map(|f| self.freq.score(f))
                    .fold(0.0, f64::max);
                SentenceHit {
                    sentence,
                    score: n * 2.0 / (1.0 + n),
                    tie_break,
                    matched: feats.into_iter().collect(),
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.tie_break.total_cmp(&a.tie_break))
                .then_with(|| a.sentence.cmp(&b.sentence))
        });
        (hits, failures)
    }

    /// Runs both stages and returns at most `budget` candidates.
    pub fn search(&self, query: &TriageQuery, budget: usize) -> TriageOutcome {
        let (mut hits, index_failures) = self.stage1(&query.triage_features);
        let total_hits = hits.len();
        hits.truncate(budget);

        let ids: BTreeSet<DocumentId> = hits.iter().map(|h| h.sentence.document.clone()).collect();
        let mut outcome = TriageOutcome {
            index_failures,
            ..TriageOutcome::default()
        };
        let mut unreadable: BTreeMap<DocumentId, CollaboratorError> = BTreeMap::new();
        for (id, result) in self.fetcher.fetch_all(&ids) {
            match result {
                Ok(doc) => {
                    outcome.terms.insert(id.clone(), TermVector::from_document(&doc));
                    outcome.documents.insert(id, doc);
                }
                Err(e) => {
                    warn!(document = %id, error = %e, "document fetch failed");
                    unreadable.insert(id, e);
                }
            }
        }

        for hit in hits {
            let document = &hit.sentence.document;
            if let Some(e) = unreadable.get(document) {
                outcome.failed_sentences.push((hit.sentence, e.clone()));
                continue;
            }
            let (Some(doc), Some(terms)) = (outcome.documents.get(document), outcome.terms.get(document)) else {
                continue;
            };
            let Some(sentence) = doc.sentence(hit.sentence.sentence) else {
                let e = CollaboratorError::SentenceNotFound {
                    sentence: hit.sentence.clone(),
                };
                warn!(error = %e, "index points past the end of a document");
                outcome.failed_sentences.push((hit.sentence, e));
                continue;
            };

            let best_run = sentence
                .ner_runs()
                .into_iter()
                .map(|span| {
                    let head = span.end - 1;
                    let overlap = triage_overlap(
                        &query.triage_features,
                        &triage_features(sentence, span, head),
                        self.freq,
                    );
                    (span, head, overlap)
                })
                .fold(None::<(TokenSpan, usize, f64)>, |best, run| match best {
                    Some(b) if b.2 >= run.2 => Some(b),
                    _ => Some(run),
                });
            let Some((span, head, triage)) = best_run else {
                debug!(sentence = %hit.sentence, "retrieved sentence has no named-entity run");
                outcome.without_mentions.push(hit.sentence);
                continue;
            };

            let attr = attribute_overlap(
                &query.attribute_features,
                &attribute_features(sentence, span, head),
            );
            let mut cos = tfidf_cosine(&query.context, terms, self.freq);
            if cos > self.config.same_document_trigger || query.context_documents.contains(document) {
                cos = cos.min(self.config.same_document_cosine);
            }
            let score = triage * (1.0 + attr) * (0.1 + cos);
            outcome.candidates.push(Candidate {
                sentence: hit.sentence,
                head,
                span,
                stage1: hit.score,
                score,
                components: vec![
                    Feat::new("triage", triage),
                    Feat::new("attr", attr),
                    Feat::new("tfidfCosine", cos),
                ],
                matched: hit.matched,
            });
        }

        outcome.candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.stage1.total_cmp(&a.stage1))
                .then_with(|| a.sentence.cmp(&b.sentence))
        });
        debug!(
            hits = total_hits,
            candidates = outcome.candidates.len(),
            without_mentions = outcome.without_mentions.len(),
            failures = outcome.failure_count(),
            "triage search finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collab::{ArgumentHead, InMemoryDocumentStore, InMemoryFeatureIndex};
    use crate::entity::EntityId;
    use crate::frequency::ExactFrequency;
    use crate::mention::Mention;

    fn docs() -> Vec<ParsedDocument> {
        vec![
            ParsedDocument::from_tagged(
                "D1",
                &["Jane/NNP/PERSON Smith/NNP/PERSON visited/VBD/O Paris/NNP/GPE today/NN/O"],
            )
            .unwrap(),
            ParsedDocument::from_tagged(
                "D2",
                &[
                    "Jane/NNP/PERSON Smith/NNP/PERSON praised/VBD/O Paris/NNP/GPE loudly/RB/O",
                    "Bob/NNP/PERSON Smith/NNP/PERSON left/VBD/O",
                ],
            )
            .unwrap(),
        ]
    }

    fn setup() -> (InMemoryFeatureIndex, DocumentFetcher, ExactFrequency) {
        let store = InMemoryDocumentStore::new();
        let index = InMemoryFeatureIndex::new();
        let freq = ExactFrequency::new(10.0).unwrap();
        for doc in docs() {
            index.index_document(&doc).unwrap();
            let words: Vec<String> = doc.words().collect();
            let refs: Vec<&str> = words.iter().map(String::as_str).collect();
            freq.record_document(&refs);
            store.insert(doc).unwrap();
        }
        let fetcher = DocumentFetcher::start(Arc::new(store), 2, 8, Duration::from_secs(5)).unwrap();
        (index, fetcher, freq)
    }

    fn jane_entity() -> Entity {
        let doc = &docs()[0];
        let m = Mention::entity(
            SentenceRef::new("D1", 0),
            &doc.sentences[0],
            ArgumentHead { head: 1, span: TokenSpan::new(0, 2) },
            None,
        )
        .unwrap();
        Entity::new(EntityId::new(0), m, &TermVector::from_document(doc))
    }

    #[test]
    fn test_stage1_diminishing_returns() {
        let (index, fetcher, freq) = setup();
        let config = SearchConfig::default();
        let search = TriageSearch::new(&index, &fetcher, &freq, &config);
        let features: BTreeSet<String> = ["pi:jane", "pi:smith", "h:Smith"].iter().map(ToString::to_string).collect();
        let (hits, failures) = search.stage1(&features);
        assert!(failures.is_empty());
        assert_eq!(hits.len(), 3);
        // Three features hit the Jane Smith sentences, two hit Bob Smith.
        assert!((hits[0].score - 1.5).abs() < 1e-12);
        assert!((hits[2].score - 4.0 / 3.0).abs() < 1e-12);
        assert_eq!(hits[2].sentence, SentenceRef::new("D2", 1));
    }

    #[test]
    fn test_search_reranks_and_dampens_same_document() {
        let (index, fetcher, freq) = setup();
        let config = SearchConfig::default();
        let search = TriageSearch::new(&index, &fetcher, &freq, &config);
        let entity = jane_entity();
        let query = TriageQuery::for_entities(&[&entity]);
        let outcome = search.search(&query, 10);

        assert_eq!(outcome.failure_count(), 0);
        assert_eq!(outcome.candidates.len(), 3);
        let best = &outcome.candidates[0];
        assert_eq!(best.head, 1);
        assert_eq!(best.span, TokenSpan::new(0, 2));
        for c in &outcome.candidates {
            let cos = crate::feature::find(&c.components, "tfidfCosine").unwrap();
            assert!(cos <= config.same_document_cosine + 1e-12);
        }
        assert_eq!(outcome.documents.len(), 2);
    }

    #[test]
    fn test_budget_limits_stage2() {
        let (index, fetcher, freq) = setup();
        let config = SearchConfig::default();
        let search = TriageSearch::new(&index, &fetcher, &freq, &config);
        let entity = jane_entity();
        let outcome = search.search(&TriageQuery::for_entities(&[&entity]), 1);
        assert_eq!(outcome.candidates.len(), 1);
    }

    #[test]
    fn test_missing_document_is_reported() {
        let (index, fetcher, freq) = setup();
        index.insert("h:Ghost", SentenceRef::new("D9", 0)).unwrap();
        let config = SearchConfig::default();
        let search = TriageSearch::new(&index, &fetcher, &freq, &config);
        let query = TriageQuery {
            triage_features: ["h:Ghost".to_string()].into_iter().collect(),
            ..TriageQuery::default()
        };
        let outcome = search.search(&query, 10);
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.failed_sentences.len(), 1);
        assert!(matches!(
            outcome.failed_sentences[0].1,
            CollaboratorError::DocumentNotFound { .. }
        ));
    }

    #[test]
    fn test_sentence_without_mentions_is_counted() {
        let store = InMemoryDocumentStore::new();
        store
            .insert(ParsedDocument::from_tagged("D7", &["the/DT/O smith/NN/O spoke/VBD/O"]).unwrap())
            .unwrap();
        let index = InMemoryFeatureIndex::new();
        index.insert("h:Smith", SentenceRef::new("D7", 0)).unwrap();
        let fetcher = DocumentFetcher::start(Arc::new(store), 1, 4, Duration::from_secs(5)).unwrap();
        let freq = ExactFrequency::new(10.0).unwrap();

        let config = SearchConfig::default();
        let search = TriageSearch::new(&index, &fetcher, &freq, &config);
        let query = TriageQuery {
            triage_features: ["h:Smith".to_string()].into_iter().collect(),
            ..TriageQuery::default()
        };
        let outcome = search.search(&query, 10);
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.without_mentions, vec![SentenceRef::new("D7", 0)]);
        assert_eq!(outcome.failure_count(), 0);
    }
}
