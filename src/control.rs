//! The population control loop.
//!
//! A [`PkbSearch`] owns the knowledge base and drains a queue of
//! [`SearchTarget`]s one at a time:
//!
//! 1. build a triage query from the target's entities;
//! 2. retrieve and re-rank candidate sentences, dropping sentences that
//!    an earlier target already processed;
//! 3. extract entity heads and predicates from every remaining sentence;
//! 4. propose and decide entity links, then situation links restricted
//!    to proposals whose entity dependencies were accepted;
//! 5. commit everything as one [`CommitBatch`];
//! 6. mark the sentences seen and enqueue entity pairs that newly share
//!    a situation.
//!
//! Retrieval fans out to the [`DocumentFetcher`] pool; all scoring and
//! the commit run on the caller's thread, so identical seeds replay
//! identical knowledge bases. [`LoopState`] is everything needed to stop
//! between targets and resume later.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collab::{
    ArgumentExtractor, ArgumentHead, DocumentId, DocumentStore, Extraction, FeatureIndex,
    ParsedDocument, Sentence, SentenceRef, TokenSpan,
};
use crate::config::PkbConfig;
use crate::entity::EntityId;
use crate::error::{InvariantViolation, PkbError, PkbResult, ValidationError};
use crate::feature::{self, Feat};
use crate::fetch::DocumentFetcher;
use crate::frequency::FrequencyEstimator;
use crate::linking::{
    decide_entity, filter_contingent, select_situations, ArgRef, EntLink, EntityLinker,
    EntityTarget, ResolvedArgument, SitLink, SituationLinker, SituationTarget,
};
use crate::mention::{Mention, MentionKey};
use crate::registry::{CommitBatch, EntityAction, EntityRef, Pkb, SituationAction};
use crate::rng::{RngState, SeededRng};
use crate::search::{TriageQuery, TriageSearch};
use crate::storage::Snapshot;
use crate::termvec::TermVector;

/// Bootstrap mention of the seed entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedQuery {
    /// Surface name of the seed entity.
    pub name: String,
    /// Named-entity type assigned to the seed mention.
    pub entity_type: String,
    /// Document containing the seed mention.
    pub document: DocumentId,
    /// First character of the mention.
    pub char_begin: usize,
    /// One past the last character of the mention.
    pub char_end: usize,
}

impl SeedQuery {
    /// Checks the query fields before any lookup.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "name".to_string(),
            });
        }
        if self.entity_type.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "entity_type".to_string(),
            });
        }
        if self.char_begin >= self.char_end {
            return Err(ValidationError::InvalidSpan {
                begin: self.char_begin,
                end: self.char_end,
            });
        }
        Ok(())
    }
}

/// Finds the sentence and argument head a seed query points at.
///
/// The sentence is the one containing `char_begin`. The span covers every
/// token overlapping the query range; the head is the token with the
/// largest character overlap, the rightmost one on ties.
pub fn resolve_seed(doc: &ParsedDocument, query: &SeedQuery) -> Result<(u32, ArgumentHead), ValidationError> {
    let not_resolved = || ValidationError::SeedNotResolved {
        document: query.document.clone(),
        begin: query.char_begin,
        end: query.char_end,
    };
    let index = doc.sentence_at_char(query.char_begin).ok_or_else(not_resolved)?;
    let sentence = doc.sentence(index).ok_or_else(not_resolved)?;

    let overlapping: Vec<(usize, usize)> = sentence
        .tokens
        .iter()
        .enumerate()
        .filter_map(|(i, t)| {
            let begin = t.char_begin.max(query.char_begin);
            let end = t.char_end.min(query.char_end);
            (end > begin).then_some((i, end - begin))
        })
        .collect();
    let (first, last) = match (overlapping.first(), overlapping.last()) {
        (Some(first), Some(last)) => (first.0, last.0),
        _ => return Err(not_resolved()),
    };
    let head = overlapping
        .iter()
        .max_by_key(|(i, overlap)| (*overlap, *i))
        .map(|(i, _)| *i)
        .ok_or_else(not_resolved)?;
    Ok((
        index,
        ArgumentHead {
            head,
            span: TokenSpan::new(first, last + 1),
        },
    ))
}

/// Progress of a search target through one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TargetPhase {
    /// Waiting in the queue.
    #[default]
    Queued,
    /// Triage retrieval in progress.
    Searching,
    /// Running the extractor over retrieved sentences.
    Extracting,
    /// Scoring and deciding proposals.
    Linking,
    /// Proposals applied to the knowledge base.
    Committed,
}

/// A set of entities searched for jointly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTarget {
    /// Member entities, sorted and deduplicated.
    pub entities: Vec<EntityId>,
    /// Current phase.
    pub phase: TargetPhase,
}

impl SearchTarget {
    /// Creates a queued target.
    pub fn new(entities: impl IntoIterator<Item = EntityId>) -> Self {
        let set: BTreeSet<EntityId> = entities.into_iter().collect();
        Self {
            entities: set.into_iter().collect(),
            phase: TargetPhase::Queued,
        }
    }
}

impl fmt::Display for SearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.entities.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", ids.join("+"))
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    /// The target, in its final phase.
    pub target: SearchTarget,
    /// Link proposals scored.
    pub generated: usize,
    /// Proposals committed.
    pub accepted: usize,
    /// Proposals rejected by the policy or by contingency.
    pub pruned: usize,
    /// Retrieved sentences skipped because an earlier target processed them.
    pub skipped_seen: usize,
    /// Retrieved sentences with no named-entity run.
    #[serde(default)]
    pub skipped_without_mentions: usize,
    /// Index lookups and sentences lost to collaborator failures.
    pub collaborator_failures: usize,
    /// Mentions flagged for merge review.
    pub merge_candidates: usize,
}

impl TargetReport {
    fn new(target: &SearchTarget) -> Self {
        Self {
            target: target.clone(),
            generated: 0,
            accepted: 0,
            pruned: 0,
            skipped_seen: 0,
            skipped_without_mentions: 0,
            collaborator_failures: 0,
            merge_candidates: 0,
        }
    }
}

/// A situation mention that cleared the threshold for several targets.
///
/// The mention is committed into every target. The targets probably
/// describe one relation and are kept here for an out-of-band merge
/// review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCandidate {
    /// The predicate mention.
    pub mention: MentionKey,
    /// Every accepted target, best scored first.
    pub targets: Vec<SituationTarget>,
}

/// The seed entity and its document context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedState {
    /// Query the seed was created from.
    pub query: SeedQuery,
    /// The seed entity.
    pub entity: EntityId,
    /// Term vector of the seed document.
    pub terms: TermVector,
}

/// Resumable state of the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    /// The knowledge base.
    pub pkb: Pkb,
    /// Sentences already processed by some target.
    pub seen: BTreeSet<SentenceRef>,
    /// Targets waiting to be searched.
    pub queue: VecDeque<SearchTarget>,
    /// Entity pairs already enqueued.
    pub known_pairs: BTreeSet<(EntityId, EntityId)>,
    /// Position of the exploration random source.
    pub rng: RngState,
    /// One report per processed target.
    pub reports: Vec<TargetReport>,
    /// Mentions flagged for merge review.
    pub merge_candidates: Vec<MergeCandidate>,
    /// Seed entity, once created.
    pub seed: Option<SeedState>,
}

impl LoopState {
    /// Fresh state over an empty knowledge base.
    #[must_use]
    pub fn new(rng_seed: u64) -> Self {
        Self::with_pkb(Pkb::new(), rng_seed)
    }

    /// Fresh state over an existing knowledge base.
    #[must_use]
    pub fn with_pkb(pkb: Pkb, rng_seed: u64) -> Self {
        Self {
            pkb,
            seen: BTreeSet::new(),
            queue: VecDeque::new(),
            known_pairs: BTreeSet::new(),
            rng: SeededRng::new(rng_seed).state(),
            reports: Vec::new(),
            merge_candidates: Vec::new(),
            seed: None,
        }
    }
}

/// External collaborators of the loop.
#[derive(Clone)]
pub struct Collaborators {
    /// Annotated documents.
    pub documents: Arc<dyn DocumentStore>,
    /// Triage feature index.
    pub index: Arc<dyn FeatureIndex>,
    /// Argument and predicate extraction.
    pub extractor: Arc<dyn ArgumentExtractor>,
    /// Corpus frequencies.
    pub frequency: Arc<dyn FrequencyEstimator>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// The single-writer population loop.
#[derive(Debug)]
pub struct PkbSearch {
    config: PkbConfig,
    collab: Collaborators,
    fetcher: DocumentFetcher,
    rng: SeededRng,
    run_id: Uuid,
    state: LoopState,
}

impl PkbSearch {
    /// Creates a loop over an empty knowledge base.
    ///
    /// # Errors
    /// Invalid configuration, or a fetch worker that cannot be spawned.
    pub fn new(config: PkbConfig, collab: Collaborators) -> PkbResult<Self> {
        let state = LoopState::new(config.control.rng_seed);
        Self::with_state(config, collab, state)
    }

    /// Creates a loop continuing from `state`.
    ///
    /// # Errors
    /// See [`PkbSearch::new`]; also rejects a state whose knowledge base
    /// fails validation.
    pub fn with_state(config: PkbConfig, collab: Collaborators, state: LoopState) -> PkbResult<Self> {
        config.validate()?;
        state.pkb.validate()?;
        let fetcher = DocumentFetcher::from_config(Arc::clone(&collab.documents), &config.control)?;
        Ok(Self {
            rng: SeededRng::from_state(state.rng),
            config,
            collab,
            fetcher,
            run_id: Uuid::new_v4(),
            state,
        })
    }

    /// Continues the run a snapshot was taken from.
    ///
    /// # Errors
    /// See [`PkbSearch::with_state`].
    pub fn resume(config: PkbConfig, collab: Collaborators, snapshot: Snapshot) -> PkbResult<Self> {
        let run_id = snapshot.run_id;
        let mut search = Self::with_state(config, collab, snapshot.state)?;
        search.run_id = run_id;
        info!(%run_id, queued = search.state.queue.len(), "resumed population run");
        Ok(search)
    }

    /// Identifier of this run, preserved across snapshots.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The knowledge base.
    #[must_use]
    pub const fn pkb(&self) -> &Pkb {
        &self.state.pkb
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &PkbConfig {
        &self.config
    }

    /// The loop state as of the last completed target.
    #[must_use]
    pub const fn state(&self) -> &LoopState {
        &self.state
    }

    /// Reports of the processed targets.
    #[must_use]
    pub fn reports(&self) -> &[TargetReport] {
        &self.state.reports
    }

    /// Mentions flagged for merge review.
    #[must_use]
    pub fn merge_candidates(&self) -> &[MergeCandidate] {
        &self.state.merge_candidates
    }

    /// Number of queued targets.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.state.queue.len()
    }

    /// Returns true if `sentence` was processed by some target.
    #[must_use]
    pub fn is_seen(&self, sentence: &SentenceRef) -> bool {
        self.state.seen.contains(sentence)
    }

    /// Creates the seed entity and enqueues it.
    ///
    /// Seeding a mention that an entity already owns returns that entity
    /// and changes nothing.
    ///
    /// # Errors
    /// Invalid or unresolvable queries, and failures fetching the seed
    /// document.
    pub fn seed(&mut self, query: &SeedQuery) -> PkbResult<EntityId> {
        query.validate()?;
        let doc = self.fetcher.fetch(&query.document)?;
        let (index, argument) = resolve_seed(&doc, query)?;
        let sentence_ref = SentenceRef::new(doc.id.clone(), index);
        let sentence = doc
            .sentence(index)
            .ok_or_else(|| PkbError::internal(format!("resolved seed sentence {sentence_ref} vanished")))?;
        let mention = Mention::entity(sentence_ref, sentence, argument, Some(&query.entity_type))
            .ok_or_else(|| PkbError::internal("resolved seed head is outside its sentence"))?;

        if let Some(existing) = self.state.pkb.entity_of(&mention.key) {
            info!(entity = %existing, mention = %mention.key, "seed mention already linked");
            return Ok(existing);
        }

        let terms = TermVector::from_document(&doc);
        let key = mention.key.clone();
        let outcome = self.state.pkb.apply(CommitBatch {
            entities: vec![EntityAction::Create {
                mention,
                document_terms: terms.clone(),
                relevance: vec![Feat::new("seed", self.config.linking.seed_weight)],
            }],
            situations: Vec::new(),
        })?;
        let entity = outcome
            .created_entities
            .first()
            .copied()
            .ok_or_else(|| PkbError::internal("seed commit created no entity"))?;

        self.state.seed = Some(SeedState {
            query: query.clone(),
            entity,
            terms,
        });
        self.state.queue.push_back(SearchTarget::new([entity]));
        info!(%entity, mention = %key, name = %query.name, "created seed entity");
        Ok(entity)
    }

    /// Queues a target over existing entities.
    ///
    /// # Errors
    /// `UnknownEntity` if an id is not in the knowledge base.
    pub fn enqueue(&mut self, entities: impl IntoIterator<Item = EntityId>) -> PkbResult<()> {
        let target = SearchTarget::new(entities);
        for id in &target.entities {
            if self.state.pkb.entity(*id).is_none() {
                return Err(InvariantViolation::UnknownEntity { id: *id }.into());
            }
        }
        debug!(%target, "enqueued target");
        self.state.queue.push_back(target);
        Ok(())
    }

    /// Processes the next queued target. Returns `None` once the queue is
    /// empty.
    ///
    /// A failing target is dropped from the queue and nothing it proposed
    /// is applied.
    ///
    /// # Errors
    /// Invariant violations surfaced by the commit, or a target naming an
    /// entity that no longer exists.
    pub fn step(&mut self) -> PkbResult<Option<TargetReport>> {
        let Some(mut target) = self.state.queue.pop_front() else {
            return Ok(None);
        };
        let report = self.process(&mut target)?;
        self.state.reports.push(report.clone());
        Ok(Some(report))
    }

    /// Drains the queue, stopping early after `control.max_targets`
    /// processed targets. Returns how many targets this call processed.
    ///
    /// # Errors
    /// The first error returned by [`PkbSearch::step`].
    pub fn run(&mut self) -> PkbResult<usize> {
        let mut processed = 0;
        while self
            .config
            .control
            .max_targets
            .map_or(true, |max| self.state.reports.len() < max)
        {
            if self.step()?.is_none() {
                break;
            }
            processed += 1;
        }
        info!(
            processed,
            entities = self.state.pkb.entity_count(),
            situations = self.state.pkb.situation_count(),
            queued = self.state.queue.len(),
            "population run stopped"
        );
        Ok(processed)
    }

    /// Snapshot of the loop between targets.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut state = self.state.clone();
        state.rng = self.rng.state();
        Snapshot::new(self.run_id, state)
    }

    /// Writes a snapshot to `path`.
    ///
    /// # Errors
    /// Storage failures.
    pub fn checkpoint(&self, path: impl AsRef<Path>) -> PkbResult<()> {
        self.snapshot().save(path)?;
        Ok(())
    }

    fn process(&mut self, target: &mut SearchTarget) -> PkbResult<TargetReport> {
        target.phase = TargetPhase::Searching;
        let entities = target
            .entities
            .iter()
            .map(|id| {
                self.state
                    .pkb
                    .entity(*id)
                    .ok_or(InvariantViolation::UnknownEntity { id: *id })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let query = TriageQuery::for_entities(&entities);
        info!(%target, features = query.triage_features.len(), "searching target");

        let search = TriageSearch::new(
            self.collab.index.as_ref(),
            &self.fetcher,
            self.collab.frequency.as_ref(),
            &self.config.search,
        );
        let outcome = search.search(&query, self.config.search.budget);
        let mut report = TargetReport::new(target);
        report.collaborator_failures = outcome.failure_count();
        report.skipped_without_mentions = outcome.without_mentions.len();

        target.phase = TargetPhase::Extracting;
        let mut sentences = Vec::new();
        let mut claimed: BTreeSet<&SentenceRef> = BTreeSet::new();
        for candidate in &outcome.candidates {
            if self.state.seen.contains(&candidate.sentence) {
                report.skipped_seen += 1;
                continue;
            }
            if !claimed.insert(&candidate.sentence) {
                continue;
            }
            let document = &candidate.sentence.document;
            let (Some(doc), Some(terms)) = (outcome.documents.get(document), outcome.terms.get(document))
            else {
                continue;
            };
            let Some(parsed) = doc.sentence(candidate.sentence.sentence) else {
                continue;
            };
            let mut extraction = self.collab.extractor.extract(parsed);
            if !extraction.entity_heads.iter().any(|a| a.head == candidate.head) {
                extraction.entity_heads.push(ArgumentHead {
                    head: candidate.head,
                    span: candidate.span,
                });
            }
            sentences.push(ExtractedSentence {
                sentence: candidate.sentence.clone(),
                parsed,
                terms,
                extraction,
            });
        }
        debug!(
            %target,
            sentences = sentences.len(),
            skipped_seen = report.skipped_seen,
            skipped_without_mentions = report.skipped_without_mentions,
            "extracted candidate sentences"
        );

        target.phase = TargetPhase::Linking;
        let mut builder = BatchBuilder::default();
        {
            let linkers = Linkers {
                pkb: &self.state.pkb,
                config: &self.config,
                freq: self.collab.frequency.as_ref(),
                entity: EntityLinker::new(
                    &self.state.pkb,
                    self.collab.frequency.as_ref(),
                    &self.config,
                    self.state.seed.as_ref().map(|s| &s.terms),
                ),
                situation: SituationLinker::new(&self.state.pkb),
            };
            for item in &sentences {
                linkers.link_sentence(item, &mut self.rng, &mut builder, &mut report)?;
            }
        }

        let processed: Vec<SentenceRef> = sentences.iter().map(|s| s.sentence.clone()).collect();
        let BatchBuilder {
            batch,
            merge_candidates,
            ..
        } = builder;
        let actions = batch.len();
        let committed = match self.state.pkb.apply(batch) {
            Ok(outcome) => outcome,
            Err(violation) => {
                error!(%target, error = %violation, "commit rejected by the knowledge base");
                return Err(violation.into());
            }
        };
        target.phase = TargetPhase::Committed;

        self.state.seen.extend(processed);
        if self.config.control.enqueue_pairs {
            for (a, b) in &committed.new_pairs {
                if self.state.known_pairs.insert((*a, *b)) {
                    let pair = SearchTarget::new([*a, *b]);
                    debug!(target = %pair, "enqueued co-argument pair");
                    self.state.queue.push_back(pair);
                }
            }
        }
        report.merge_candidates = merge_candidates.len();
        self.state.merge_candidates.extend(merge_candidates);
        self.state.rng = self.rng.state();
        report.target = target.clone();

        info!(
            %target,
            generated = report.generated,
            accepted = report.accepted,
            pruned = report.pruned,
            actions,
            created_entities = committed.created_entities.len(),
            created_situations = committed.created_situations.len(),
            "committed target"
        );
        Ok(report)
    }
}

struct ExtractedSentence<'o> {
    sentence: SentenceRef,
    parsed: &'o Sentence,
    terms: &'o TermVector,
    extraction: Extraction,
}

/// Accepted actions of the current target.
#[derive(Default)]
struct BatchBuilder {
    batch: CommitBatch,
    /// Entity action index per entity mention.
    slots: BTreeMap<MentionKey, usize>,
    merge_candidates: Vec<MergeCandidate>,
}

impl BatchBuilder {
    fn push_entity(&mut self, key: MentionKey, action: EntityAction) {
        self.slots.insert(key, self.batch.entities.len());
        self.batch.entities.push(action);
    }

    /// Commits a situation mention into every selected target, best
    /// first, and returns how many actions were pushed. At most one
    /// creation is kept.
    fn push_situation(&mut self, mention: Mention, mut selected: Vec<SitLink>) -> PkbResult<usize> {
        // Stable sort keeps the first of equally scored proposals in front.
        selected.sort_by(|a, b| b.total().total_cmp(&a.total()));
        if selected.len() > 1 {
            warn!(
                mention = %mention.key,
                targets = selected.len(),
                "situation mention accepted for several targets, flagged for merge review"
            );
            self.merge_candidates.push(MergeCandidate {
                mention: mention.key.clone(),
                targets: selected.iter().map(|l| l.target.clone()).collect(),
            });
        }

        let mut pushed = 0;
        let mut created = false;
        for link in &selected {
            let action = match &link.target {
                SituationTarget::Existing(id) => SituationAction::Link {
                    situation: *id,
                    mention: mention.clone(),
                },
                SituationTarget::New { .. } if created => continue,
                SituationTarget::New { arguments } => {
                    let arguments = arguments
                        .iter()
                        .map(|arg| match arg {
                            ArgRef::Entity(id) => Ok(EntityRef::Existing(*id)),
                            ArgRef::NewFrom(key) => self
                                .slots
                                .get(key)
                                .map(|slot| EntityRef::Pending(*slot))
                                .ok_or_else(|| {
                                    PkbError::internal(format!("situation argument {key} has no entity action"))
                                }),
                        })
                        .collect::<PkbResult<BTreeSet<EntityRef>>>()?;
                    created = true;
                    SituationAction::Create {
                        arguments,
                        mention: mention.clone(),
                    }
                }
            };
            self.batch.situations.push(action);
            pushed += 1;
        }
        Ok(pushed)
    }
}

/// Read-only linking context over the pre-commit knowledge base.
struct Linkers<'a> {
    pkb: &'a Pkb,
    config: &'a PkbConfig,
    freq: &'a dyn FrequencyEstimator,
    entity: EntityLinker<'a>,
    situation: SituationLinker<'a>,
}

impl Linkers<'_> {
    fn link_sentence(
        &self,
        item: &ExtractedSentence<'_>,
        rng: &mut SeededRng,
        builder: &mut BatchBuilder,
        report: &mut TargetReport,
    ) -> PkbResult<()> {
        let mut accepted: BTreeMap<MentionKey, EntityTarget> = BTreeMap::new();
        let mut resolved: BTreeMap<usize, ResolvedArgument> = BTreeMap::new();

        for argument in &item.extraction.entity_heads {
            if resolved.contains_key(&argument.head) {
                continue;
            }
            let Some(mention) = Mention::entity(item.sentence.clone(), item.parsed, *argument, None) else {
                continue;
            };
            let key = mention.key.clone();

            if let Some(owner) = self.pkb.entity_of(&key) {
                let target = EntityTarget::Existing(owner);
                let interestingness = feature::sum(&self.entity.interestingness(&mention, item.terms));
                accepted.insert(key.clone(), target);
                resolved.insert(
                    argument.head,
                    ResolvedArgument {
                        link: EntLink {
                            source: key,
                            target,
                            score: vec![Feat::new("alreadyLinked", 0.0)],
                        },
                        interestingness,
                    },
                );
                continue;
            }

            let links = self.entity.propose(&mention, item.terms);
            let interestingness = self.entity.interestingness(&mention, item.terms);
            report.generated += links.len();
            let Some(decision) = decide_entity(&links, interestingness, &self.config.linking, rng) else {
                report.pruned += links.len();
                continue;
            };
            let interest = feature::sum(&decision.interestingness);

            match decision.accepted_target() {
                Some(target) => {
                    report.accepted += 1;
                    report.pruned += links.len() - 1;
                    debug!(
                        mention = %key,
                        ?target,
                        score = decision.candidate.total(),
                        interestingness = interest,
                        "accepted entity link"
                    );
                    let action = match target {
                        EntityTarget::Existing(entity) => EntityAction::Link {
                            entity,
                            mention,
                            document_terms: item.terms.clone(),
                        },
                        EntityTarget::New => EntityAction::Create {
                            mention,
                            document_terms: item.terms.clone(),
                            relevance: decision.interestingness.clone(),
                        },
                    };
                    accepted.insert(key.clone(), target);
                    builder.push_entity(key, action);
                }
                None => {
                    report.pruned += links.len();
                    debug!(
                        mention = %key,
                        draw = ?decision.draw,
                        interestingness = interest,
                        "pruned entity mention"
                    );
                }
            }
            // Rejected mentions stay resolved so dependent situation
            // proposals are generated and then filtered out.
            resolved.insert(
                argument.head,
                ResolvedArgument {
                    link: decision.candidate,
                    interestingness: interest,
                },
            );
        }

        for (head, features) in &item.extraction.predicate_features {
            let arguments: Vec<ResolvedArgument> = item
                .extraction
                .predicate_arguments
                .get(head)
                .into_iter()
                .flatten()
                .filter_map(|h| resolved.get(h).cloned())
                .collect();
            if arguments.is_empty() {
                continue;
            }
            let keys = arguments.iter().map(|a| a.link.source.clone()).collect();
            let Some(mention) = Mention::situation(item.sentence.clone(), item.parsed, *head, keys, features, self.freq)
            else {
                continue;
            };
            if self.pkb.situation_of(&mention.key).is_some() {
                continue;
            }

            let links = self.situation.propose(&mention, &arguments);
            let generated = links.len();
            report.generated += generated;
            let (kept, rejected) = filter_contingent(links, &accepted);
            let selected = select_situations(kept, &self.config.linking);
            if selected.is_empty() {
                report.pruned += generated;
                debug!(mention = %mention.key, rejected, "pruned situation mention");
                continue;
            }
            debug!(
                mention = %mention.key,
                selected = selected.len(),
                best = selected.iter().map(SitLink::total).fold(f64::NEG_INFINITY, f64::max),
                "accepted situation link"
            );
            let committed = builder.push_situation(mention, selected)?;
            report.accepted += committed;
            report.pruned += generated - committed;
        }
        Ok(())
    }
}
