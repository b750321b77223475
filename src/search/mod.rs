//! Candidate retrieval for search targets.

pub mod triage;

pub use triage::{Candidate, SentenceHit, TriageOutcome, TriageQuery, TriageSearch};
