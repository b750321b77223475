//! # pkbp - Incremental knowledge-base population
//!
//! pkbp grows a deduplicated knowledge base of entities and the
//! situations relating them by searching an annotated corpus outward from
//! a seed mention. Every retrieved mention is either linked to a known
//! node, promoted to a new node, or pruned.
//!
//! ## Core Concepts
//!
//! - **Mention**: one occurrence of an entity or predicate in a sentence
//! - **Entity**: a cluster of coreferent entity mentions
//! - **Situation**: a relation over a fixed set of core-argument entities
//! - **Pkb**: both registries plus the entity/situation membership graph
//! - **PkbSearch**: the single-writer loop that searches, links and commits
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pkbp::{Collaborators, PkbConfig, PkbSearch, SeedQuery};
//!
//! let collab = Collaborators {
//!     documents: Arc::new(store),
//!     index: Arc::new(index),
//!     extractor: Arc::new(pkbp::collab::NerRunExtractor),
//!     frequency: Arc::new(frequencies),
//! };
//! let mut search = PkbSearch::new(PkbConfig::default(), collab)?;
//! search.seed(&SeedQuery {
//!     name: "Jane Smith".into(),
//!     entity_type: "PERSON".into(),
//!     document: "NYT_001".into(),
//!     char_begin: 0,
//!     char_end: 10,
//! })?;
//! search.run()?;
//! search.checkpoint("run.snapshot")?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod feature;
pub mod frequency;
pub mod mention;
pub mod rng;
pub mod termvec;

// Knowledge base
pub mod entity;
pub mod registry;
pub mod situation;

// Collaborators and retrieval
pub mod collab;
pub mod fetch;
pub mod search;

// Linking and control
pub mod control;
pub mod linking;

// Persistence
pub mod storage;

pub use config::{ControlConfig, FrequencyConfig, LinkingConfig, PkbConfig, SearchConfig};
pub use error::{
    CollaboratorError, InvariantViolation, PkbError, PkbResult, StorageError, ValidationError,
};
pub use feature::Feat;
pub use frequency::{ExactFrequency, FrequencyEstimator, ReversibleHashWriter, SketchFrequency};
pub use mention::{Mention, MentionKey, MentionKind};
pub use rng::{RngState, SeededRng};
pub use termvec::{tfidf_cosine, TermVector};

pub use entity::{Entity, EntityId};
pub use registry::{
    CommitBatch, CommitOutcome, EntityAction, EntityRef, MembershipGraph, Pkb, SituationAction,
};
pub use situation::{Situation, SituationId};

pub use collab::{
    ArgumentExtractor, DocumentId, DocumentStore, FeatureIndex, ParsedDocument, SentenceRef,
};
pub use fetch::DocumentFetcher;
pub use search::{Candidate, TriageOutcome, TriageQuery, TriageSearch};

pub use control::{
    Collaborators, LoopState, MergeCandidate, PkbSearch, SearchTarget, SeedQuery, TargetPhase,
    TargetReport,
};
pub use linking::{EntLink, EntityLinker, EntityTarget, SitLink, SituationLinker, SituationTarget};

pub use storage::{Snapshot, SnapshotStore};
