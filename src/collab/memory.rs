//! In-memory collaborators.
//!
//! Thread-safe reference implementations of the collaborator traits.
//! They are intended for embedded usage and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::collab::traits::{ArgumentExtractor, DocumentStore, FeatureIndex};
use crate::collab::types::{
    ArgumentHead, DocumentId, Extraction, ParsedDocument, Sentence, SentenceRef,
};
use crate::error::CollaboratorError;
use crate::mention::triage_features;

/// Maximum governor hops between an argument head and its predicate.
const MAX_PREDICATE_HOPS: usize = 3;

fn lock_err(context: &'static str) -> CollaboratorError {
    CollaboratorError::Disconnected {
        what: format!("poisoned lock: {context}"),
    }
}

/// Document store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<HashMap<DocumentId, Arc<ParsedDocument>>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a document.
    pub fn insert(&self, doc: ParsedDocument) -> Result<(), CollaboratorError> {
        let mut guard = self.docs.write().map_err(|_| lock_err("documents"))?;
        guard.insert(doc.id.clone(), Arc::new(doc));
        Ok(())
    }

    /// Number of stored documents.
    pub fn len(&self) -> Result<usize, CollaboratorError> {
        Ok(self.docs.read().map_err(|_| lock_err("documents"))?.len())
    }

    /// Returns true if no document is stored.
    pub fn is_empty(&self) -> Result<bool, CollaboratorError> {
        Ok(self.len()? == 0)
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, id: &DocumentId) -> Result<Arc<ParsedDocument>, CollaboratorError> {
        let guard = self.docs.read().map_err(|_| lock_err("documents"))?;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| CollaboratorError::DocumentNotFound { document: id.clone() })
    }
}

/// Inverted feature index backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryFeatureIndex {
    postings: RwLock<HashMap<String, BTreeSet<SentenceRef>>>,
}

impl InMemoryFeatureIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one posting.
    pub fn insert(&self, feature: impl Into<String>, sentence: SentenceRef) -> Result<(), CollaboratorError> {
        let mut guard = self.postings.write().map_err(|_| lock_err("postings"))?;
        guard.entry(feature.into()).or_default().insert(sentence);
        Ok(())
    }

    /// Indexes the triage features of every named-entity run of a document.
    pub fn index_document(&self, doc: &ParsedDocument) -> Result<usize, CollaboratorError> {
        let mut guard = self.postings.write().map_err(|_| lock_err("postings"))?;
        let mut added = 0;
        for (sref, sentence) in doc.sentence_refs().into_iter().zip(&doc.sentences) {
            for span in sentence.ner_runs() {
                let head = span.end - 1;
                for feature in triage_features(sentence, span, head) {
                    if guard.entry(feature).or_default().insert(sref.clone()) {
                        added += 1;
                    }
                }
            }
        }
        Ok(added)
    }
}

impl FeatureIndex for InMemoryFeatureIndex {
    fn lookup(&self, feature: &str) -> Result<Vec<SentenceRef>, CollaboratorError> {
        let guard = self.postings.read().map_err(|_| lock_err("postings"))?;
        Ok(guard
            .get(feature)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Extractor pairing named-entity runs with the nearest governing verb.
///
/// Every named-entity run is an entity argument headed by its last token.
/// A verb governing an argument head within a few hops becomes a predicate
/// with features `p:<lemma>` and `<deprel>:<lemma>` per argument.
#[derive(Debug, Default, Clone, Copy)]
pub struct NerRunExtractor;

impl ArgumentExtractor for NerRunExtractor {
    fn extract(&self, sentence: &Sentence) -> Extraction {
        let mut out = Extraction::default();
        let mut features: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        let mut arguments: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();

        for span in sentence.ner_runs() {
            let head = span.end - 1;
            out.entity_heads.push(ArgumentHead { head, span });

            let predicate = sentence
                .ancestors(head)
                .into_iter()
                .take(MAX_PREDICATE_HOPS)
                .find(|&g| sentence.tokens[g].is_verb());
            if let Some(p) = predicate {
                let lemma = &sentence.tokens[p].lemma;
                let feats = features.entry(p).or_default();
                feats.insert(format!("p:{lemma}"));
                feats.insert(format!("{}:{lemma}", sentence.tokens[head].deprel));
                arguments.entry(p).or_default().insert(head);
            }
        }

        out.predicate_features = features;
        out.predicate_arguments = arguments;
        out
    }
}
