//! Types exchanged with external collaborators.
//!
//! Parsed documents are produced by an upstream annotation pipeline and
//! consumed read-only. Token indices are positions within a sentence and
//! character offsets are positions within the document text.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Identifier of a document in the annotation store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates a document id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A sentence of a document: the unit of retrieval and of "seen" marking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SentenceRef {
    /// Owning document.
    pub document: DocumentId,
    /// Sentence index within the document.
    pub sentence: u32,
}

impl SentenceRef {
    /// Creates a sentence reference.
    #[must_use]
    pub fn new(document: impl Into<DocumentId>, sentence: u32) -> Self {
        Self {
            document: document.into(),
            sentence,
        }
    }
}

impl fmt::Display for SentenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.document, self.sentence)
    }
}

/// Half-open token range `[start, end)` within one sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenSpan {
    /// First token.
    pub start: usize,
    /// One past the last token.
    pub end: usize,
}

impl TokenSpan {
    /// Creates a span.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Span covering a single token.
    #[must_use]
    pub const fn single(token: usize) -> Self {
        Self {
            start: token,
            end: token + 1,
        }
    }

    /// Returns true if `token` lies inside the span.
    #[must_use]
    pub const fn contains(&self, token: usize) -> bool {
        token >= self.start && token < self.end
    }

    /// Number of tokens covered.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns true if the span covers no token.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// One annotated token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Surface form.
    pub word: String,
    /// Lemma.
    pub lemma: String,
    /// Part-of-speech tag.
    pub pos: String,
    /// Named-entity tag, `O` when outside any entity.
    pub ner: String,
    /// First character offset in the document.
    pub char_begin: usize,
    /// One past the last character offset in the document.
    pub char_end: usize,
    /// Dependency governor within the sentence, `None` for the root.
    pub governor: Option<usize>,
    /// Dependency relation to the governor.
    pub deprel: String,
}

impl Token {
    /// Returns true for proper-noun tokens.
    #[must_use]
    pub fn is_proper_noun(&self) -> bool {
        self.pos.starts_with("NNP")
    }

    /// Returns true for verb tokens.
    #[must_use]
    pub fn is_verb(&self) -> bool {
        self.pos.starts_with("VB")
    }

    /// Returns true if the token carries a named-entity tag.
    #[must_use]
    pub fn is_named(&self) -> bool {
        !self.ner.is_empty() && self.ner != "O"
    }
}

/// One parsed sentence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Sentence {
    /// Tokens in order.
    pub tokens: Vec<Token>,
}

impl Sentence {
    /// Parses a whitespace-separated tagged sentence.
    ///
    /// Each token is `word/POS/NER` or `word/POS/NER/GOV/DEPREL`, where `GOV`
    /// is the 1-based governor index and `0` marks the root. Tokens are
    /// assumed to be separated by single spaces starting at `char_offset`.
    pub fn parse_tagged(line: &str, char_offset: usize) -> Result<Self, ValidationError> {
        let mut tokens = Vec::new();
        let mut cursor = char_offset;
        for raw in line.split_whitespace() {
            let parts: Vec<&str> = raw.split('/').collect();
            if parts.len() != 3 && parts.len() != 5 {
                return Err(ValidationError::InvalidToken {
                    token: raw.to_string(),
                    reason: "expected word/POS/NER or word/POS/NER/GOV/DEPREL".to_string(),
                });
            }
            let word = parts[0];
            if word.is_empty() {
                return Err(ValidationError::EmptyField {
                    field: "token.word".to_string(),
                });
            }
            let (governor, deprel) = if parts.len() == 5 {
                let gov: usize = parts[3].parse().map_err(|_| ValidationError::InvalidToken {
                    token: raw.to_string(),
                    reason: "governor is not an index".to_string(),
                })?;
                (gov.checked_sub(1), parts[4].to_string())
            } else {
                (None, "dep".to_string())
            };
            let len = word.chars().count();
            tokens.push(Token {
                word: word.to_string(),
                lemma: word.to_lowercase(),
                pos: parts[1].to_string(),
                ner: parts[2].to_string(),
                char_begin: cursor,
                char_end: cursor + len,
                governor,
                deprel,
            });
            cursor += len + 1;
        }
        let n = tokens.len();
        if let Some(bad) = tokens.iter().find(|t| t.governor.is_some_and(|g| g >= n)) {
            return Err(ValidationError::InvalidToken {
                token: bad.word.clone(),
                reason: format!("governor points past the {n} tokens of the sentence"),
            });
        }
        Ok(Self { tokens })
    }

    /// Character range covered by this sentence.
    #[must_use]
    pub fn char_range(&self) -> Option<(usize, usize)> {
        let first = self.tokens.first()?;
        let last = self.tokens.last()?;
        Some((first.char_begin, last.char_end))
    }

    /// Maximal runs of tokens sharing the same named-entity tag.
    #[must_use]
    pub fn ner_runs(&self) -> Vec<TokenSpan> {
        let mut runs = Vec::new();
        let mut i = 0;
        while i < self.tokens.len() {
            if !self.tokens[i].is_named() {
                i += 1;
                continue;
            }
            let start = i;
            while i + 1 < self.tokens.len() && self.tokens[i + 1].ner == self.tokens[start].ner {
                i += 1;
            }
            runs.push(TokenSpan::new(start, i + 1));
            i += 1;
        }
        runs
    }

    /// Surface text of a token span.
    #[must_use]
    pub fn span_text(&self, span: TokenSpan) -> String {
        let end = span.end.min(self.tokens.len());
        let start = span.start.min(end);
        self.tokens[start..end]
            .iter()
            .map(|t| t.word.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Governor chain of `token`, nearest first, bounded by the sentence length.
    #[must_use]
    pub fn ancestors(&self, token: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut current = self.tokens.get(token).and_then(|t| t.governor);
        while let Some(g) = current {
            if g >= self.tokens.len() || out.contains(&g) || g == token {
                break;
            }
            out.push(g);
            current = self.tokens[g].governor;
        }
        out
    }
}

/// A document with its sentence segmentation and annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// Document id.
    pub id: DocumentId,
    /// Sentences in order.
    pub sentences: Vec<Sentence>,
}

impl ParsedDocument {
    /// Creates a document.
    #[must_use]
    pub fn new(id: impl Into<DocumentId>, sentences: Vec<Sentence>) -> Self {
        Self {
            id: id.into(),
            sentences,
        }
    }

    /// Builds a document from tagged sentence lines (see [`Sentence::parse_tagged`]).
    pub fn from_tagged(id: impl Into<DocumentId>, lines: &[&str]) -> Result<Self, ValidationError> {
        let mut sentences = Vec::with_capacity(lines.len());
        let mut offset = 0;
        for line in lines {
            let sentence = Sentence::parse_tagged(line, offset)?;
            if let Some((_, end)) = sentence.char_range() {
                offset = end + 1;
            }
            sentences.push(sentence);
        }
        Ok(Self::new(id, sentences))
    }

    /// Returns a sentence by index.
    #[must_use]
    pub fn sentence(&self, index: u32) -> Option<&Sentence> {
        self.sentences.get(index as usize)
    }

    /// Index of the sentence whose character range contains `offset`.
    #[must_use]
    pub fn sentence_at_char(&self, offset: usize) -> Option<u32> {
        self.sentences.iter().position(|s| {
            s.char_range()
                .is_some_and(|(begin, end)| offset >= begin && offset < end)
        })
        .and_then(|i| u32::try_from(i).ok())
    }

    /// References to every sentence of the document.
    #[must_use]
    pub fn sentence_refs(&self) -> Vec<SentenceRef> {
        (0..self.sentences.len())
            .filter_map(|i| u32::try_from(i).ok())
            .map(|i| SentenceRef::new(self.id.clone(), i))
            .collect()
    }

    /// Lowercased word tokens, the input of document term vectors.
    pub fn words(&self) -> impl Iterator<Item = String> + '_ {
        self.sentences
            .iter()
            .flat_map(|s| s.tokens.iter())
            .map(|t| t.word.to_lowercase())
    }
}

/// An entity argument found by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentHead {
    /// Head token.
    pub head: usize,
    /// Token span of the full mention.
    pub span: TokenSpan,
}

/// Output of the argument/predicate extractor for one sentence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Extraction {
    /// Entity argument heads.
    pub entity_heads: Vec<ArgumentHead>,
    /// Predicate head token to its syntactic features.
    pub predicate_features: BTreeMap<usize, BTreeSet<String>>,
    /// Predicate head token to the head tokens of its arguments.
    pub predicate_arguments: BTreeMap<usize, BTreeSet<usize>>,
}
