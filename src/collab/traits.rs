//! Contracts of the external collaborators.
//!
//! The core only consumes these: documents and the inverted index are
//! populated elsewhere, and extraction is a pure function of a sentence.

use std::sync::Arc;

use crate::collab::types::{DocumentId, Extraction, ParsedDocument, Sentence, SentenceRef};
use crate::error::CollaboratorError;

/// Read-only access to annotated documents.
pub trait DocumentStore: Send + Sync {
    /// Fetches a parsed document.
    ///
    /// # Errors
    /// `CollaboratorError::DocumentNotFound` if the id is unknown, or any
    /// other collaborator failure of the backend.
    fn get(&self, id: &DocumentId) -> Result<Arc<ParsedDocument>, CollaboratorError>;
}

/// Inverted index from triage feature to the sentences containing it.
pub trait FeatureIndex: Send + Sync {
    /// Returns the sentences indexed under `feature`.
    fn lookup(&self, feature: &str) -> Result<Vec<SentenceRef>, CollaboratorError>;

    /// Looks up several features at once.
    ///
    /// Failures are reported per feature so one bad key does not lose the
    /// whole batch.
    fn lookup_batch(
        &self,
        features: &[String],
    ) -> Vec<(String, Result<Vec<SentenceRef>, CollaboratorError>)> {
        features
            .iter()
            .map(|f| (f.clone(), self.lookup(f)))
            .collect()
    }
}

/// Dependency-based argument and predicate extraction.
pub trait ArgumentExtractor: Send + Sync {
    /// Extracts entity argument heads and predicates from one sentence.
    fn extract(&self, sentence: &Sentence) -> Extraction;
}

impl<F> ArgumentExtractor for F
where
    F: Fn(&Sentence) -> Extraction + Send + Sync,
{
    fn extract(&self, sentence: &Sentence) -> Extraction {
        self(sentence)
    }
}
