//! Accept/reject policy applied to link proposals before commit.

use std::collections::BTreeMap;

use crate::config::LinkingConfig;
use crate::feature::{self, Feat};
use crate::linking::entity::{EntLink, EntityTarget};
use crate::linking::situation::{SitLink, SituationTarget};
use crate::mention::MentionKey;
use crate::rng::SeededRng;

/// Logistic function.
#[must_use]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Outcome of the entity policy for one mention.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDecision {
    /// The proposal the policy considered: the best link when it clears
    /// the threshold, the new-entity proposal otherwise.
    pub candidate: EntLink,
    /// Whether `candidate` is accepted.
    pub accepted: bool,
    /// Interestingness components of the mention.
    pub interestingness: Vec<Feat>,
    /// Random draw, when the decision was stochastic.
    pub draw: Option<f64>,
}

impl EntityDecision {
    /// Target of the accepted proposal.
    #[must_use]
    pub fn accepted_target(&self) -> Option<EntityTarget> {
        self.accepted.then_some(self.candidate.target)
    }
}

/// Decides between linking, creating and pruning.
///
/// With no existing link proposal the new entity is accepted outright. A
/// best link scoring above the threshold is accepted. Otherwise a new
/// entity is created with probability `sigmoid(interestingness)`. The
/// generator is only consulted in that last case.
///
/// `links` is the output of [`crate::linking::EntityLinker::propose`] and
/// must contain the new-entity proposal.
#[must_use]
pub fn decide_entity(
    links: &[EntLink],
    interestingness: Vec<Feat>,
    config: &LinkingConfig,
    rng: &mut SeededRng,
) -> Option<EntityDecision> {
    let new = links.iter().find(|l| l.is_new())?;
    let best = links.iter().find(|l| !l.is_new());

    let Some(best) = best else {
        return Some(EntityDecision {
            candidate: new.clone(),
            accepted: true,
            interestingness,
            draw: None,
        });
    };
    if best.total() > config.entity_link_threshold {
        return Some(EntityDecision {
            candidate: best.clone(),
            accepted: true,
            interestingness,
            draw: None,
        });
    }

    let draw = rng.uniform();
    let accepted = draw < sigmoid(feature::sum(&interestingness));
    Some(EntityDecision {
        candidate: new.clone(),
        accepted,
        interestingness,
        draw: Some(draw),
    })
}

/// Keeps the situation proposals whose every entity dependency was
/// accepted with the assumed target. Returns the kept proposals and the
/// number rejected.
#[must_use]
pub fn filter_contingent(
    links: Vec<SitLink>,
    accepted: &BTreeMap<MentionKey, EntityTarget>,
) -> (Vec<SitLink>, usize) {
    let before = links.len();
    let kept: Vec<SitLink> = links
        .into_iter()
        .filter(|l| {
            l.contingent_on
                .iter()
                .all(|(key, target)| accepted.get(key) == Some(target))
        })
        .collect();
    let rejected = before - kept.len();
    (kept, rejected)
}

/// Applies the situation threshold to the proposals of one predicate.
///
/// Every link to an existing situation clearing the threshold is kept,
/// duplicates removed. Only when none does, the best new-situation
/// proposal clearing the threshold is kept.
#[must_use]
pub fn select_situations(links: Vec<SitLink>, config: &LinkingConfig) -> Vec<SitLink> {
    let threshold = config.situation_link_threshold;
    let mut existing: Vec<SitLink> = Vec::new();
    let mut best_new: Option<SitLink> = None;
    for link in links {
        if link.total() < threshold {
            continue;
        }
        match link.target {
            SituationTarget::Existing(_) => {
                if !existing.iter().any(|l| l.target == link.target) {
                    existing.push(link);
                }
            }
            SituationTarget::New { .. } => {
                if best_new.as_ref().map_or(true, |b| link.total() > b.total()) {
                    best_new = Some(link);
                }
            }
        }
    }
    if existing.is_empty() {
        best_new.into_iter().collect()
    } else {
        existing
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::collab::SentenceRef;
    use crate::entity::EntityId;
    use crate::linking::situation::ArgRef;
    use crate::situation::SituationId;

    fn key(head: usize) -> MentionKey {
        MentionKey::new(SentenceRef::new("D1", 0), head)
    }

    fn ent_link(target: EntityTarget, score: f64) -> EntLink {
        EntLink {
            source: key(0),
            target,
            score: vec![Feat::new("s", score)],
        }
    }

    fn sit_link(target: SituationTarget, score: f64, deps: Vec<(MentionKey, EntityTarget)>) -> SitLink {
        SitLink {
            source: key(1),
            target,
            score: vec![Feat::new("s", score)],
            contingent_on: deps,
        }
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(50.0) > 0.999_999);
        assert!(sigmoid(-50.0) < 1e-6);
    }

    #[test]
    fn test_empty_pkb_always_creates() {
        let config = LinkingConfig::default();
        let mut rng = SeededRng::new(1);
        let before = rng.state();
        let d = decide_entity(&[ent_link(EntityTarget::New, -1.0)], Vec::new(), &config, &mut rng).unwrap();
        assert!(d.accepted);
        assert_eq!(d.accepted_target(), Some(EntityTarget::New));
        assert_eq!(d.draw, None);
        assert_eq!(rng.state(), before);
    }

    #[test]
    fn test_confident_link_accepted() {
        let config = LinkingConfig::default();
        let mut rng = SeededRng::new(1);
        let links = [
            ent_link(EntityTarget::Existing(EntityId::new(3)), 1.6),
            ent_link(EntityTarget::New, -2.6),
        ];
        let d = decide_entity(&links, Vec::new(), &config, &mut rng).unwrap();
        assert_eq!(d.accepted_target(), Some(EntityTarget::Existing(EntityId::new(3))));
    }

    #[test]
    fn test_weak_link_is_stochastic() {
        let config = LinkingConfig::default();
        let links = [
            ent_link(EntityTarget::Existing(EntityId::new(3)), 1.5),
            ent_link(EntityTarget::New, -2.5),
        ];
        let mut rng = SeededRng::new(1);
        let boring = vec![Feat::new("ner=X", -1000.0)];
        let d = decide_entity(&links, boring, &config, &mut rng).unwrap();
        assert!(!d.accepted);
        assert!(d.draw.is_some());
        assert_eq!(d.accepted_target(), None);

        let exciting = vec![Feat::new("ner=X", 1000.0)];
        let d = decide_entity(&links, exciting, &config, &mut rng).unwrap();
        assert_eq!(d.accepted_target(), Some(EntityTarget::New));
    }

    #[test]
    fn test_contingency_filter() {
        let accepted: BTreeMap<MentionKey, EntityTarget> =
            [(key(0), EntityTarget::Existing(EntityId::new(1)))].into_iter().collect();
        let ok = sit_link(
            SituationTarget::Existing(SituationId::new(1)),
            3.0,
            vec![(key(0), EntityTarget::Existing(EntityId::new(1)))],
        );
        let wrong_target = sit_link(
            SituationTarget::Existing(SituationId::new(2)),
            3.0,
            vec![(key(0), EntityTarget::New)],
        );
        let pruned_arg = sit_link(
            SituationTarget::Existing(SituationId::new(3)),
            3.0,
            vec![(key(0), EntityTarget::Existing(EntityId::new(1))), (key(2), EntityTarget::New)],
        );
        let (kept, rejected) = filter_contingent(vec![ok.clone(), wrong_target, pruned_arg], &accepted);
        assert_eq!(kept, vec![ok]);
        assert_eq!(rejected, 2);
    }

    #[test]
    fn test_select_prefers_links_and_single_new() {
        let config = LinkingConfig::default();
        let new_args = |h: usize| SituationTarget::New {
            arguments: [ArgRef::NewFrom(key(h))].into_iter().collect::<BTreeSet<_>>(),
        };

        let picked = select_situations(
            vec![
                sit_link(new_args(5), 4.0, Vec::new()),
                sit_link(new_args(6), 5.0, Vec::new()),
                sit_link(new_args(7), 1.0, Vec::new()),
            ],
            &config,
        );
        assert_eq!(picked.len(), 1);
        assert!((picked[0].total() - 5.0).abs() < 1e-12);

        let picked = select_situations(
            vec![
                sit_link(SituationTarget::Existing(SituationId::new(1)), 2.0, Vec::new()),
                sit_link(SituationTarget::Existing(SituationId::new(2)), 2.5, Vec::new()),
                sit_link(SituationTarget::Existing(SituationId::new(3)), 1.9, Vec::new()),
                sit_link(new_args(5), 9.0, Vec::new()),
            ],
            &config,
        );
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|l| !l.is_new()));
    }
}
