//! Situation linking: scores a predicate mention against situations that
//! already relate its resolved arguments.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::feature::{self, Feat};
use crate::linking::entity::{EntLink, EntityTarget};
use crate::mention::{Mention, MentionKey};
use crate::registry::Pkb;
use crate::situation::SituationId;

/// A core argument as seen before commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArgRef {
    /// An entity already in the knowledge base.
    Entity(EntityId),
    /// The entity that would be created from this mention.
    NewFrom(MentionKey),
}

impl ArgRef {
    fn from_link(link: &EntLink) -> Self {
        match link.target {
            EntityTarget::Existing(id) => Self::Entity(id),
            EntityTarget::New => Self::NewFrom(link.source.clone()),
        }
    }
}

/// Target of a situation link proposal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SituationTarget {
    /// Add the mention to an existing situation.
    Existing(SituationId),
    /// Create a situation with these core arguments.
    New {
        /// Core arguments.
        arguments: BTreeSet<ArgRef>,
    },
}

/// A scored situation link proposal, valid only if every entity link it
/// depends on is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SitLink {
    /// Predicate mention being linked.
    pub source: MentionKey,
    /// Proposed target.
    pub target: SituationTarget,
    /// Named score components.
    pub score: Vec<Feat>,
    /// Argument mentions and the entity targets this proposal assumes.
    pub contingent_on: Vec<(MentionKey, EntityTarget)>,
}

impl SitLink {
    /// Sum of the score components.
    #[must_use]
    pub fn total(&self) -> f64 {
        feature::sum(&self.score)
    }

    /// Returns true for new-situation proposals.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self.target, SituationTarget::New { .. })
    }
}

/// Entity resolution of one argument of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArgument {
    /// The entity link the argument is expected to take.
    pub link: EntLink,
    /// Summed interestingness of the argument mention.
    pub interestingness: f64,
}

/// Scores situation mentions against a knowledge base snapshot.
pub struct SituationLinker<'a> {
    pkb: &'a Pkb,
}

impl<'a> SituationLinker<'a> {
    /// Creates a linker.
    #[must_use]
    pub const fn new(pkb: &'a Pkb) -> Self {
        Self { pkb }
    }

    /// Proposals for `mention` given the resolutions of its arguments.
    ///
    /// Every unordered pair of distinct arguments yields either links to
    /// the situations already relating both, or one new-situation
    /// proposal. A predicate with a single distinct argument is handled
    /// the same way against situations with exactly that argument.
    #[must_use]
    pub fn propose(&self, mention: &Mention, arguments: &[ResolvedArgument]) -> Vec<SitLink> {
        let mut out = Vec::new();
        let mut distinct: Vec<(ArgRef, &ResolvedArgument)> = Vec::new();
        for arg in arguments {
            let r = ArgRef::from_link(&arg.link);
            if !distinct.iter().any(|(seen, _)| *seen == r) {
                distinct.push((r, arg));
            }
        }

        if distinct.len() == 1 {
            let (r, arg) = &distinct[0];
            let unary: BTreeSet<ArgRef> = [r.clone()].into_iter().collect();
            let existing = match r {
                ArgRef::Entity(id) => {
                    let set: BTreeSet<EntityId> = [*id].into_iter().collect();
                    self.pkb.membership().situation_with_exact(&set)
                }
                ArgRef::NewFrom(_) => None,
            };
            let contingent = vec![(arg.link.source.clone(), arg.link.target)];
            out.extend(self.proposal(mention, unary, existing.into_iter().collect(), &[*arg], contingent));
            return out;
        }

        let mut pairs: BTreeSet<(ArgRef, ArgRef)> = BTreeSet::new();
        for (i, (ra, a)) in distinct.iter().enumerate() {
            for (rb, b) in &distinct[i + 1..] {
                let key = if ra <= rb {
                    (ra.clone(), rb.clone())
                } else {
                    (rb.clone(), ra.clone())
                };
                if !pairs.insert(key) {
                    continue;
                }
                let existing = match (ra, rb) {
                    (ArgRef::Entity(x), ArgRef::Entity(y)) => self.pkb.situations_with_both(*x, *y),
                    _ => Vec::new(),
                };
                let arguments: BTreeSet<ArgRef> = [ra.clone(), rb.clone()].into_iter().collect();
                let contingent = vec![
                    (a.link.source.clone(), a.link.target),
                    (b.link.source.clone(), b.link.target),
                ];
                let proposals = self.proposal(mention, arguments, existing, &[*a, *b], contingent);
                out.extend(proposals);
            }
        }
        out
    }

    fn proposal(
        &self,
        mention: &Mention,
        arguments: BTreeSet<ArgRef>,
        existing: Vec<SituationId>,
        args: &[&ResolvedArgument],
        contingent_on: Vec<(MentionKey, EntityTarget)>,
    ) -> Vec<SitLink> {
        if existing.is_empty() {
            let score = args
                .iter()
                .map(|a| Feat::new(format!("interesting[{}]", a.link.source), a.interestingness))
                .collect();
            return vec![SitLink {
                source: mention.key.clone(),
                target: SituationTarget::New { arguments },
                score,
                contingent_on,
            }];
        }
        existing
            .into_iter()
            .filter_map(|id| self.pkb.situation(id))
            .map(|situation| SitLink {
                source: mention.key.clone(),
                target: SituationTarget::Existing(situation.id),
                score: vec![Feat::new("featureOverlap", situation.feature_overlap(mention))],
                contingent_on: contingent_on.clone(),
            })
            .collect()
    }
}
