//! Mentions: occurrences of entities and situations in one sentence.
//!
//! Entity and situation mentions share the same record (head, span,
//! feature tables) and differ only in [`MentionKind`]. Mentions are built
//! once from a parsed sentence and never mutated afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collab::{ArgumentHead, DocumentId, Sentence, SentenceRef, TokenSpan};
use crate::frequency::FrequencyEstimator;

/// Maximum dependency hops between a head and an attribute token.
pub const MAX_ATTRIBUTE_HOPS: usize = 4;

/// Weight of attribute features found in the mention's own sentence.
pub const SAME_SENTENCE_WEIGHT: f64 = 2.0;

/// Relative weight of the path-free backoff attribute feature.
pub const BACKOFF_WEIGHT: f64 = 0.2;

/// Stable identity of a mention: its sentence and head token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MentionKey {
    /// Sentence containing the mention.
    pub sentence: SentenceRef,
    /// Head token index.
    pub head: usize,
}

impl MentionKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(sentence: SentenceRef, head: usize) -> Self {
        Self { sentence, head }
    }
}

impl fmt::Display for MentionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sentence, self.head)
    }
}

/// What a mention refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MentionKind {
    /// A named entity.
    Entity {
        /// Named-entity type, e.g. `PERSON`.
        ner_type: String,
    },
    /// A predicate with resolved arguments.
    Situation {
        /// Entity mentions filling the argument slots, in extractor order.
        arguments: Vec<MentionKey>,
        /// Syntactic feature to specificity weight.
        features: BTreeMap<String, f64>,
    },
}

/// One occurrence of an entity or situation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    /// Sentence and head token.
    pub key: MentionKey,
    /// Token span of the full mention.
    pub span: TokenSpan,
    /// Surface form of the head token.
    pub head_word: String,
    /// Surface form of the span.
    pub span_text: String,
    /// Cheap exact-match features used for retrieval.
    pub triage_features: BTreeSet<String>,
    /// Contextual features used for re-ranking.
    pub attribute_features: BTreeMap<String, f64>,
    /// Entity or situation specifics.
    pub kind: MentionKind,
}

impl Mention {
    /// Builds an entity mention from an extracted argument head.
    ///
    /// The type defaults to the head token's NER tag. Returns `None` if
    /// the head is not a token of `sentence`.
    #[must_use]
    pub fn entity(
        sentence_ref: SentenceRef,
        sentence: &Sentence,
        argument: ArgumentHead,
        ner_type: Option<&str>,
    ) -> Option<Self> {
        let head = sentence.tokens.get(argument.head)?;
        let span = if argument.span.contains(argument.head) {
            argument.span
        } else {
            TokenSpan::single(argument.head)
        };
        Some(Self {
            key: MentionKey::new(sentence_ref, argument.head),
            span,
            head_word: head.word.clone(),
            span_text: sentence.span_text(span),
            triage_features: triage_features(sentence, span, argument.head),
            attribute_features: attribute_features(sentence, span, argument.head),
            kind: MentionKind::Entity {
                ner_type: ner_type.unwrap_or(head.ner.as_str()).to_string(),
            },
        })
    }

    /// Builds a situation mention for a predicate head.
    ///
    /// Feature weights are the specificity of each feature. Returns `None`
    /// if the head is not a token of `sentence`.
    #[must_use]
    pub fn situation(
        sentence_ref: SentenceRef,
        sentence: &Sentence,
        head: usize,
        arguments: Vec<MentionKey>,
        features: &BTreeSet<String>,
        freq: &dyn FrequencyEstimator,
    ) -> Option<Self> {
        let token = sentence.tokens.get(head)?;
        let span = TokenSpan::single(head);
        Some(Self {
            key: MentionKey::new(sentence_ref, head),
            span,
            head_word: token.word.clone(),
            span_text: token.word.clone(),
            triage_features: BTreeSet::new(),
            attribute_features: BTreeMap::new(),
            kind: MentionKind::Situation {
                arguments,
                features: features.iter().map(|f| (f.clone(), freq.score(f))).collect(),
            },
        })
    }

    /// Document containing the mention.
    #[must_use]
    pub fn document(&self) -> &DocumentId {
        &self.key.sentence.document
    }

    /// Returns true for entity mentions.
    #[must_use]
    pub const fn is_entity(&self) -> bool {
        matches!(self.kind, MentionKind::Entity { .. })
    }

    /// Named-entity type of an entity mention.
    #[must_use]
    pub fn ner_type(&self) -> Option<&str> {
        match &self.kind {
            MentionKind::Entity { ner_type } => Some(ner_type),
            MentionKind::Situation { .. } => None,
        }
    }

    /// Arguments of a situation mention; empty for entities.
    #[must_use]
    pub fn arguments(&self) -> &[MentionKey] {
        match &self.kind {
            MentionKind::Situation { arguments, .. } => arguments,
            MentionKind::Entity { .. } => &[],
        }
    }

    /// Feature weights of a situation mention.
    #[must_use]
    pub fn situation_features(&self) -> Option<&BTreeMap<String, f64>> {
        match &self.kind {
            MentionKind::Situation { features, .. } => Some(features),
            MentionKind::Entity { .. } => None,
        }
    }
}

fn clean_span_text(text: &str) -> String {
    text.chars()
        .filter_map(|c| match c {
            '-' => Some(' '),
            c if c.is_ascii_digit() => Some('0'),
            c if c.is_ascii_alphabetic() || c == ' ' => Some(c),
            _ => None,
        })
        .collect()
}

fn normalize_head(word: &str) -> String {
    if word.chars().filter(char::is_ascii_digit).count() >= 4 {
        word.chars()
            .map(|c| if c.is_ascii_digit() { '0' } else { c })
            .collect()
    } else {
        word.to_string()
    }
}

/// Returns true for features too common to be useful for retrieval.
#[must_use]
pub fn is_stop_feature(feature: &str) -> bool {
    let Some((_, value)) = feature.split_once(':') else {
        return false;
    };
    matches!(value, "" | "s" | "i" | "I" | "a" | "A" | "the" | "of")
        || (value.len() < 10 && value.bytes().all(|b| b == b'0'))
}

/// Triage features of an entity mention.
///
/// `pi:<token>` per lowercased token of the cleaned span text, `h:<head>`
/// and `hi:<lowercased head>` when it differs. Stop features are dropped.
#[must_use]
pub fn triage_features(sentence: &Sentence, span: TokenSpan, head: usize) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let text = clean_span_text(&sentence.span_text(span));
    for token in text.split_whitespace() {
        out.insert(format!("pi:{}", token.to_lowercase()));
    }
    if let Some(token) = sentence.tokens.get(head) {
        let h = normalize_head(&token.word);
        let hi = h.to_lowercase();
        if hi != h {
            out.insert(format!("hi:{hi}"));
        }
        out.insert(format!("h:{h}"));
    }
    out.retain(|f| !is_stop_feature(f));
    out
}

/// Attribute features of an entity mention.
///
/// For every other named proper noun in the sentence: the dependency path
/// from the head rendered `<NER>-<deprel>-...-<word>` (when within
/// [`MAX_ATTRIBUTE_HOPS`]) plus a path-free backoff `<NER>-backoff-<word>`.
#[must_use]
pub fn attribute_features(sentence: &Sentence, span: TokenSpan, head: usize) -> BTreeMap<String, f64> {
    let mut out: BTreeMap<String, f64> = BTreeMap::new();
    if head >= sentence.tokens.len() {
        return out;
    }
    let mut up = vec![head];
    up.extend(sentence.ancestors(head));

    for (j, token) in sentence.tokens.iter().enumerate() {
        if span.contains(j) || !token.is_proper_noun() || !token.is_named() {
            continue;
        }
        let word = token.word.to_lowercase();
        let mut add = |name: String, weight: f64| {
            let slot = out.entry(name).or_insert(0.0);
            *slot = slot.max(weight);
        };
        add(
            format!("{}-backoff-{word}", token.ner),
            SAME_SENTENCE_WEIGHT * BACKOFF_WEIGHT,
        );

        let mut down = vec![j];
        down.extend(sentence.ancestors(j));
        let Some((i_up, i_down)) = up
            .iter()
            .enumerate()
            .find_map(|(i, node)| down.iter().position(|d| d == node).map(|k| (i, k)))
        else {
            continue;
        };
        if i_up + i_down > MAX_ATTRIBUTE_HOPS {
            continue;
        }
        let rels: Vec<&str> = up[..i_up]
            .iter()
            .chain(down[..i_down].iter().rev())
            .map(|&n| sentence.tokens[n].deprel.as_str())
            .collect();
        add(
            format!("{}-{}-{word}", token.ner, rels.join("-")),
            SAME_SENTENCE_WEIGHT,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frequency::ExactFrequency;

    fn sentence() -> Sentence {
        Sentence::parse_tagged(
            "Jane/NNP/PERSON/2/compound Smith/NNP/PERSON/3/nsubj visited/VBD/O/0/root \
             Paris/NNP/GPE/3/dobj in/IN/O/6/case 2019/CD/DATE/3/nmod",
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_triage_features() {
        let s = sentence();
        let feats = triage_features(&s, TokenSpan::new(0, 2), 1);
        let expected: BTreeSet<String> = ["pi:jane", "pi:smith", "h:Smith", "hi:smith"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(feats, expected);
    }

    #[test]
    fn test_triage_features_normalize_digits() {
        let s = Sentence::parse_tagged("F-16s/NNP/MISC 1999/CD/DATE", 0).unwrap();
        let feats = triage_features(&s, TokenSpan::single(0), 0);
        assert!(feats.contains("pi:f"));
        assert!(feats.contains("h:F-16s"));
        assert!(feats.contains("pi:00s"));

        let year = triage_features(&s, TokenSpan::single(1), 1);
        // "0000" is a stop feature once digits are normalized.
        assert!(!year.contains("h:0000"));
        assert!(!year.contains("pi:0000"));
    }

    #[test]
    fn test_stop_features() {
        assert!(is_stop_feature("pi:the"));
        assert!(is_stop_feature("h:000"));
        assert!(!is_stop_feature("h:Smith"));
        assert!(!is_stop_feature("nocolon"));
    }

    #[test]
    fn test_attribute_features() {
        let s = sentence();
        let feats = attribute_features(&s, TokenSpan::new(0, 2), 1);
        assert_eq!(feats.get("GPE-nsubj-dobj-paris"), Some(&SAME_SENTENCE_WEIGHT));
        assert_eq!(
            feats.get("GPE-backoff-paris"),
            Some(&(SAME_SENTENCE_WEIGHT * BACKOFF_WEIGHT))
        );
        // Tokens inside the mention span and non-proper nouns are skipped.
        assert!(!feats.keys().any(|k| k.ends_with("-jane")));
        assert!(!feats.keys().any(|k| k.ends_with("-2019")));
    }

    #[test]
    fn test_entity_mention() {
        let s = sentence();
        let sref = SentenceRef::new("D1", 0);
        let m = Mention::entity(
            sref.clone(),
            &s,
            ArgumentHead { head: 1, span: TokenSpan::new(0, 2) },
            None,
        )
        .unwrap();
        assert_eq!(m.key, MentionKey::new(sref, 1));
        assert_eq!(m.span_text, "Jane Smith");
        assert_eq!(m.ner_type(), Some("PERSON"));
        assert!(m.is_entity());
        assert!(m.arguments().is_empty());
        assert_eq!(m.document().as_str(), "D1");

        let out_of_range = Mention::entity(
            SentenceRef::new("D1", 0),
            &s,
            ArgumentHead { head: 99, span: TokenSpan::single(99) },
            None,
        );
        assert!(out_of_range.is_none());
    }

    #[test]
    fn test_situation_mention_weights() {
        let s = sentence();
        let sref = SentenceRef::new("D1", 0);
        let freq = ExactFrequency::new(10.0).unwrap();
        freq.observe_n("p:visited", 10);
        let features: BTreeSet<String> =
            ["p:visited", "nsubj:visited"].iter().map(ToString::to_string).collect();
        let m = Mention::situation(
            sref.clone(),
            &s,
            2,
            vec![MentionKey::new(sref.clone(), 1), MentionKey::new(sref, 3)],
            &features,
            &freq,
        )
        .unwrap();
        let weights = m.situation_features().unwrap();
        assert!((weights["p:visited"] - 11.0 / 20.0).abs() < 1e-12);
        assert!((weights["nsubj:visited"] - 1.0).abs() < 1e-12);
        assert_eq!(m.arguments().len(), 2);
        assert!(!m.is_entity());
        assert_eq!(m.ner_type(), None);
    }
}
