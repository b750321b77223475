//! Link proposals for entity and situation mentions, and the policy that
//! accepts or rejects them.
//!
//! Linkers only read the knowledge base; accepted proposals are turned
//! into a [`crate::registry::CommitBatch`] by the control loop.

pub mod entity;
pub mod policy;
pub mod situation;

pub use entity::{attribute_overlap, triage_overlap, EntLink, EntityLinker, EntityTarget};
pub use policy::{decide_entity, filter_contingent, select_situations, sigmoid, EntityDecision};
pub use situation::{ArgRef, ResolvedArgument, SitLink, SituationLinker, SituationTarget};
