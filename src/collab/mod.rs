//! External collaborators: document store, feature index, extractor.

pub mod memory;
pub mod traits;
pub mod types;

pub use memory::{InMemoryDocumentStore, InMemoryFeatureIndex, NerRunExtractor};
pub use traits::{ArgumentExtractor, DocumentStore, FeatureIndex};
pub use types::{
    ArgumentHead, DocumentId, Extraction, ParsedDocument, Sentence, SentenceRef, Token, TokenSpan,
};
