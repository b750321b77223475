//! The knowledge base: entity and situation registries plus the
//! membership graph between them.
//!
//! All mutation goes through [`Pkb::apply`], which validates a whole
//! [`CommitBatch`] before touching anything. A batch either applies
//! completely or not at all.
//!
//! An entity mention belongs to exactly one entity. A situation mention
//! may be committed into several situations in the same batch (one
//! predicate can be evidence for several relations); the control loop
//! flags those mentions for merge review.
//!
//! The membership graph is two id-keyed adjacency maps, never object
//! references, so the structure serializes cleanly.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId};
use crate::error::InvariantViolation;
use crate::feature::Feat;
use crate::mention::{Mention, MentionKey};
use crate::situation::{Situation, SituationId};
use crate::termvec::TermVector;

/// Many-to-many index between entities and the situations they argue in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipGraph {
    entity_situations: BTreeMap<EntityId, BTreeSet<SituationId>>,
    situation_entities: BTreeMap<SituationId, BTreeSet<EntityId>>,
}

impl MembershipGraph {
    /// Records `situation` with its core arguments.
    pub fn insert(&mut self, situation: SituationId, arguments: &BTreeSet<EntityId>) {
        for entity in arguments {
            self.entity_situations
                .entry(*entity)
                .or_default()
                .insert(situation);
        }
        self.situation_entities
            .entry(situation)
            .or_default()
            .extend(arguments.iter().copied());
    }

    /// Situations `entity` is a core argument of.
    pub fn situations_of(&self, entity: EntityId) -> impl Iterator<Item = SituationId> + '_ {
        self.entity_situations
            .get(&entity)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    /// Core arguments of `situation`.
    #[must_use]
    pub fn arguments_of(&self, situation: SituationId) -> Option<&BTreeSet<EntityId>> {
        self.situation_entities.get(&situation)
    }

    /// Situations listing every entity of `entities` as a core argument.
    #[must_use]
    pub fn situations_with_all(&self, entities: &BTreeSet<EntityId>) -> Vec<SituationId> {
        let mut iter = entities.iter();
        let Some(first) = iter.next() else {
            return Vec::new();
        };
        let mut out: BTreeSet<SituationId> = self.situations_of(*first).collect();
        for entity in iter {
            let theirs: BTreeSet<SituationId> = self.situations_of(*entity).collect();
            out.retain(|s| theirs.contains(s));
        }
        out.into_iter().collect()
    }

    /// The situation whose core arguments are exactly `entities`, if any.
    #[must_use]
    pub fn situation_with_exact(&self, entities: &BTreeSet<EntityId>) -> Option<SituationId> {
        self.situations_with_all(entities)
            .into_iter()
            .find(|s| self.situation_entities.get(s) == Some(entities))
    }

    /// Number of situations indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.situation_entities.len()
    }

    /// Returns true if no situation is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.situation_entities.is_empty()
    }

    fn edges(&self) -> Vec<(SituationId, Vec<EntityId>)> {
        self.situation_entities
            .iter()
            .map(|(s, e)| (*s, e.iter().copied().collect()))
            .collect()
    }
}

/// Reference to an entity inside a commit batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityRef {
    /// An entity already in the knowledge base.
    Existing(EntityId),
    /// The entity produced by the batch's entity action at this index.
    Pending(usize),
}

/// Entity mutation of a commit batch.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityAction {
    /// Create a new entity from `mention`.
    Create {
        /// First mention.
        mention: Mention,
        /// Term vector of the mention's document.
        document_terms: TermVector,
        /// Initial relevance reasons.
        relevance: Vec<Feat>,
    },
    /// Add `mention` to an existing entity.
    Link {
        /// Target entity.
        entity: EntityId,
        /// Mention to add.
        mention: Mention,
        /// Term vector of the mention's document.
        document_terms: TermVector,
    },
}

impl EntityAction {
    /// The mention this action attaches.
    #[must_use]
    pub const fn mention(&self) -> &Mention {
        match self {
            Self::Create { mention, .. } | Self::Link { mention, .. } => mention,
        }
    }
}

/// Situation mutation of a commit batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SituationAction {
    /// Create a new situation with the given core arguments.
    Create {
        /// Core arguments, possibly created in the same batch.
        arguments: BTreeSet<EntityRef>,
        /// First mention.
        mention: Mention,
    },
    /// Add `mention` to an existing situation.
    Link {
        /// Target situation.
        situation: SituationId,
        /// Mention to add.
        mention: Mention,
    },
}

impl SituationAction {
    /// The mention this action attaches.
    #[must_use]
    pub const fn mention(&self) -> &Mention {
        match self {
            Self::Create { mention, .. } | Self::Link { mention, .. } => mention,
        }
    }
}

/// Accepted mutations of one search target, applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    /// Entity actions; applied first.
    pub entities: Vec<EntityAction>,
    /// Situation actions; applied after all entity actions.
    pub situations: Vec<SituationAction>,
}

impl CommitBatch {
    /// Returns true if the batch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.situations.is_empty()
    }

    /// Number of actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len() + self.situations.len()
    }
}

/// What a commit changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Resolved entity per entity action, in batch order.
    pub entity_ids: Vec<EntityId>,
    /// Entities created.
    pub created_entities: Vec<EntityId>,
    /// Mentions linked into existing entities.
    pub linked_entities: usize,
    /// Resolved situation per situation action, in batch order.
    pub situation_ids: Vec<SituationId>,
    /// Situations created.
    pub created_situations: Vec<SituationId>,
    /// Mentions linked into existing situations.
    pub linked_situations: usize,
    /// Creations folded into a situation created earlier in the same batch.
    pub folded_situations: usize,
    /// Entity pairs that became co-arguments of a new situation.
    pub new_pairs: Vec<(EntityId, EntityId)>,
}

enum PlannedSituation {
    Create { id: SituationId, arguments: BTreeSet<EntityId> },
    Link { id: SituationId },
}

/// The knowledge base.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "PkbRecord", try_from = "PkbRecord")]
pub struct Pkb {
    entities: BTreeMap<EntityId, Entity>,
    situations: BTreeMap<SituationId, Situation>,
    membership: MembershipGraph,
    entity_owner: BTreeMap<MentionKey, EntityId>,
    situation_owner: BTreeMap<MentionKey, BTreeSet<SituationId>>,
    next_entity: u64,
    next_situation: u64,
}

impl Pkb {
    /// Creates an empty knowledge base.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an entity by id.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Returns a situation by id.
    #[must_use]
    pub fn situation(&self, id: SituationId) -> Option<&Situation> {
        self.situations.get(&id)
    }

    /// All entities in id order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// All situations in id order.
    pub fn situations(&self) -> impl Iterator<Item = &Situation> {
        self.situations.values()
    }

    /// The membership graph.
    #[must_use]
    pub const fn membership(&self) -> &MembershipGraph {
        &self.membership
    }

    /// Number of entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of situations.
    #[must_use]
    pub fn situation_count(&self) -> usize {
        self.situations.len()
    }

    /// Returns true if the knowledge base holds no entity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entity owning an entity mention.
    #[must_use]
    pub fn entity_of(&self, mention: &MentionKey) -> Option<EntityId> {
        self.entity_owner.get(mention).copied()
    }

    /// Situation owning a situation mention; the lowest id when the
    /// mention was committed into several.
    #[must_use]
    pub fn situation_of(&self, mention: &MentionKey) -> Option<SituationId> {
        self.situation_owner.get(mention).and_then(|s| s.first().copied())
    }

    /// Every situation a situation mention was committed into, in id order.
    #[must_use]
    pub fn situations_of_mention(&self, mention: &MentionKey) -> Vec<SituationId> {
        self.situation_owner
            .get(mention)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Situations listing both entities as core arguments.
    #[must_use]
    pub fn situations_with_both(&self, a: EntityId, b: EntityId) -> Vec<SituationId> {
        let pair: BTreeSet<EntityId> = [a, b].into_iter().collect();
        self.membership.situations_with_all(&pair)
    }

    /// Applies a batch atomically.
    ///
    /// Entity actions are applied before situation actions so situations
    /// can reference entities created in the same batch. A situation
    /// creation whose argument set matches one created earlier in the
    /// same batch is folded into it. Several situation actions may carry
    /// the same mention as long as they resolve to different situations.
    ///
    /// # Errors
    /// Any invariant violation aborts the whole batch with no effect.
    pub fn apply(&mut self, batch: CommitBatch) -> Result<CommitOutcome, InvariantViolation> {
        let mut outcome = CommitOutcome::default();

        // Validate entity actions and resolve their ids.
        let mut next_entity = self.next_entity;
        let mut batch_mentions: BTreeSet<&MentionKey> = BTreeSet::new();
        for action in &batch.entities {
            let key = &action.mention().key;
            if let Some(owner) = self.entity_owner.get(key) {
                return Err(InvariantViolation::MentionAlreadyOwned {
                    mention: key.clone(),
                    owner: owner.to_string(),
                });
            }
            if !batch_mentions.insert(key) {
                return Err(InvariantViolation::MentionAlreadyOwned {
                    mention: key.clone(),
                    owner: "another action of this commit".to_string(),
                });
            }
            let id = match action {
                EntityAction::Create { .. } => {
                    let id = EntityId::new(next_entity);
                    next_entity += 1;
                    id
                }
                EntityAction::Link { entity, .. } => {
                    if !self.entities.contains_key(entity) {
                        return Err(InvariantViolation::UnknownEntity { id: *entity });
                    }
                    *entity
                }
            };
            outcome.entity_ids.push(id);
        }

        // Validate situation actions against the post-entity state.
        let mut next_situation = self.next_situation;
        let mut created_in_batch: BTreeMap<BTreeSet<EntityId>, SituationId> = BTreeMap::new();
        let mut batch_targets: BTreeSet<(&MentionKey, SituationId)> = BTreeSet::new();
        let mut plan = Vec::with_capacity(batch.situations.len());
        for action in &batch.situations {
            let key = &action.mention().key;
            if let Some(owner) = self.situation_of(key) {
                return Err(InvariantViolation::MentionAlreadyOwned {
                    mention: key.clone(),
                    owner: owner.to_string(),
                });
            }
            let planned = match action {
                SituationAction::Create { arguments, .. } => {
                    let mut resolved = BTreeSet::new();
                    for arg in arguments {
                        let id = match arg {
                            EntityRef::Existing(id) => {
                                if !self.entities.contains_key(id) {
                                    return Err(InvariantViolation::UnknownEntity { id: *id });
                                }
                                *id
                            }
                            EntityRef::Pending(slot) => *outcome
                                .entity_ids
                                .get(*slot)
                                .ok_or(InvariantViolation::DanglingPendingEntity { slot: *slot })?,
                        };
                        resolved.insert(id);
                    }
                    if resolved.is_empty() {
                        return Err(InvariantViolation::EmptyCoreArguments);
                    }
                    if let Some(existing) = self.membership.situation_with_exact(&resolved) {
                        return Err(InvariantViolation::DuplicateCoreArguments {
                            arguments: resolved.into_iter().collect(),
                            existing,
                        });
                    }
                    if let Some(id) = created_in_batch.get(&resolved) {
                        outcome.folded_situations += 1;
                        PlannedSituation::Link { id: *id }
                    } else {
                        let id = SituationId::new(next_situation);
                        next_situation += 1;
                        created_in_batch.insert(resolved.clone(), id);
                        PlannedSituation::Create { id, arguments: resolved }
                    }
                }
                SituationAction::Link { situation, .. } => {
                    if !self.situations.contains_key(situation) {
                        return Err(InvariantViolation::UnknownSituation { id: *situation });
                    }
                    PlannedSituation::Link { id: *situation }
                }
            };
            let target = match &planned {
                PlannedSituation::Create { id, .. } | PlannedSituation::Link { id } => *id,
            };
            if !batch_targets.insert((key, target)) {
                return Err(InvariantViolation::MentionAlreadyOwned {
                    mention: key.clone(),
                    owner: format!("{target} (twice in this commit)"),
                });
            }
            plan.push(planned);
        }

        // Apply. Nothing below can fail.
        for (action, id) in batch.entities.into_iter().zip(outcome.entity_ids.iter().copied()) {
            match action {
                EntityAction::Create {
                    mention,
                    document_terms,
                    relevance,
                } => {
                    self.entity_owner.insert(mention.key.clone(), id);
                    let mut entity = Entity::new(id, mention, &document_terms);
                    entity.relevance = relevance;
                    self.entities.insert(id, entity);
                    outcome.created_entities.push(id);
                }
                EntityAction::Link {
                    mention,
                    document_terms,
                    ..
                } => {
                    self.entity_owner.insert(mention.key.clone(), id);
                    if let Some(entity) = self.entities.get_mut(&id) {
                        entity.add_mention(mention, &document_terms);
                    }
                    outcome.linked_entities += 1;
                }
            }
        }
        self.next_entity = next_entity;

        for (action, planned) in batch.situations.into_iter().zip(plan) {
            let mention = match action {
                SituationAction::Create { mention, .. } | SituationAction::Link { mention, .. } => mention,
            };
            match planned {
                PlannedSituation::Create { id, arguments } => {
                    self.situation_owner.entry(mention.key.clone()).or_default().insert(id);
                    self.membership.insert(id, &arguments);
                    let ids: Vec<EntityId> = arguments.iter().copied().collect();
                    for (i, a) in ids.iter().enumerate() {
                        for b in &ids[i + 1..] {
                            outcome.new_pairs.push((*a, *b));
                        }
                    }
                    self.situations.insert(id, Situation::new(id, arguments, mention));
                    outcome.created_situations.push(id);
                    outcome.situation_ids.push(id);
                }
                PlannedSituation::Link { id } => {
                    self.situation_owner.entry(mention.key.clone()).or_default().insert(id);
                    if let Some(situation) = self.situations.get_mut(&id) {
                        situation.add_mention(mention);
                    }
                    outcome.linked_situations += 1;
                    outcome.situation_ids.push(id);
                }
            }
        }
        self.next_situation = next_situation;

        Ok(outcome)
    }

    /// Checks ownership maps and the membership graph against the nodes.
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let mut owners: BTreeMap<&MentionKey, EntityId> = BTreeMap::new();
        for entity in self.entities.values() {
            for m in &entity.mentions {
                if let Some(prev) = owners.insert(&m.key, entity.id) {
                    return Err(InvariantViolation::MentionAlreadyOwned {
                        mention: m.key.clone(),
                        owner: prev.to_string(),
                    });
                }
            }
        }
        let mut sit_members: BTreeSet<(&MentionKey, SituationId)> = BTreeSet::new();
        for situation in self.situations.values() {
            if situation.core_arguments().is_empty() {
                return Err(InvariantViolation::EmptyCoreArguments);
            }
            for arg in situation.core_arguments() {
                if !self.entities.contains_key(arg) {
                    return Err(InvariantViolation::UnknownEntity { id: *arg });
                }
            }
            if self.membership.arguments_of(situation.id) != Some(situation.core_arguments()) {
                return Err(InvariantViolation::CoreArgumentsChanged { id: situation.id });
            }
            for m in &situation.mentions {
                if !sit_members.insert((&m.key, situation.id)) {
                    return Err(InvariantViolation::MentionAlreadyOwned {
                        mention: m.key.clone(),
                        owner: situation.id.to_string(),
                    });
                }
            }
        }
        if self.membership.len() != self.situations.len() {
            return Err(InvariantViolation::EmptyCoreArguments);
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct PkbRecord {
    entities: Vec<Entity>,
    situations: Vec<Situation>,
    membership: Vec<(SituationId, Vec<EntityId>)>,
    next_entity: u64,
    next_situation: u64,
}

impl From<Pkb> for PkbRecord {
    fn from(pkb: Pkb) -> Self {
        Self {
            membership: pkb.membership.edges(),
            entities: pkb.entities.into_values().collect(),
            situations: pkb.situations.into_values().collect(),
            next_entity: pkb.next_entity,
            next_situation: pkb.next_situation,
        }
    }
}

impl TryFrom<PkbRecord> for Pkb {
    type Error = InvariantViolation;

    fn try_from(record: PkbRecord) -> Result<Self, Self::Error> {
        let mut pkb = Self {
            next_entity: record.next_entity,
            next_situation: record.next_situation,
            ..Self::default()
        };
        for (situation, arguments) in record.membership {
            pkb.membership
                .insert(situation, &arguments.into_iter().collect());
        }
        for entity in record.entities {
            for m in &entity.mentions {
                pkb.entity_owner.insert(m.key.clone(), entity.id);
            }
            pkb.next_entity = pkb.next_entity.max(entity.id.value() + 1);
            pkb.entities.insert(entity.id, entity);
        }
        for situation in record.situations {
            for m in &situation.mentions {
                pkb.situation_owner
                    .entry(m.key.clone())
                    .or_default()
                    .insert(situation.id);
            }
            pkb.next_situation = pkb.next_situation.max(situation.id.value() + 1);
            pkb.situations.insert(situation.id, situation);
        }
        pkb.validate()?;
        Ok(pkb)
    }
}
