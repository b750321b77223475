//! Configuration for pkbp.
//!
//! Every tunable constant of the pipeline lives here. All fields have
//! serde defaults so a partial TOML file only needs to name what it
//! overrides.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PkbResult, StorageError, ValidationError};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PkbConfig {
    /// Frequency estimation settings.
    #[serde(default)]
    pub frequency: FrequencyConfig,
    /// Triage search settings.
    #[serde(default)]
    pub search: SearchConfig,
    /// Link scoring and acceptance settings.
    #[serde(default)]
    pub linking: LinkingConfig,
    /// Control loop settings.
    #[serde(default)]
    pub control: ControlConfig,
}

/// Frequency estimator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyConfig {
    /// Smoothing constant `k` of the specificity score `(k+1)/(k+f)`.
    #[serde(default = "default_smoothing_k")]
    pub smoothing_k: f64,
    /// Number of independent hash rows in the sketch.
    #[serde(default = "default_sketch_rows")]
    pub sketch_rows: usize,
    /// Each sketch row holds `2^sketch_log_width` buckets.
    #[serde(default = "default_sketch_log_width")]
    pub sketch_log_width: u32,
    /// Entries kept in the reversible hash's recent tier before compaction.
    #[serde(default = "default_recent_limit")]
    pub reversible_recent_limit: usize,
    /// Entries kept in the reversible hash's common tier after trimming.
    #[serde(default = "default_common_limit")]
    pub reversible_common_limit: usize,
    /// Count subtracted from surviving common entries on trim.
    #[serde(default = "default_decay")]
    pub reversible_decay: u32,
}

/// Triage search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Number of stage-1 candidates re-ranked in stage 2.
    #[serde(default = "default_budget")]
    pub budget: usize,
    /// Cosine above which two documents are treated as the same document.
    #[serde(default = "default_same_document_trigger")]
    pub same_document_trigger: f64,
    /// Value the cosine is clamped to for same-document comparisons.
    #[serde(default = "default_same_document_cosine")]
    pub same_document_cosine: f64,
}

/// Link scoring and acceptance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkingConfig {
    /// A best entity link scoring above this is accepted outright.
    #[serde(default = "default_entity_threshold")]
    pub entity_link_threshold: f64,
    /// Situation proposals scoring at least this are accepted.
    #[serde(default = "default_situation_threshold")]
    pub situation_link_threshold: f64,
    /// Fixed bias of every new-entity proposal.
    #[serde(default = "default_new_entity_bias")]
    pub new_entity_bias: f64,
    /// Weight of the seed entity's relevance reason.
    #[serde(default = "default_seed_weight")]
    pub seed_weight: f64,
    /// Multiplier of the seed-document cosine in interestingness.
    #[serde(default = "default_seed_similarity_weight")]
    pub seed_similarity_weight: f64,
    /// Prior for named-entity types absent from `ner_priors`.
    #[serde(default = "default_ner_prior")]
    pub default_ner_prior: f64,
    /// At most this many triage features contribute to the word-frequency prior.
    #[serde(default = "default_max_word_freq_features")]
    pub max_word_freq_features: usize,
    /// Stop accumulating the word-frequency prior once a feature adds less than this.
    #[serde(default = "default_word_freq_tolerance")]
    pub word_freq_tolerance: f64,
    /// Prior added to interestingness per named-entity type.
    #[serde(default = "default_ner_priors")]
    pub ner_priors: BTreeMap<String, f64>,
}

/// Control loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Seed of the exploration random source.
    #[serde(default = "default_rng_seed")]
    pub rng_seed: u64,
    /// Enqueue entity pairs that newly share a situation.
    #[serde(default = "default_enqueue_pairs")]
    pub enqueue_pairs: bool,
    /// Stop `run` after this many targets.
    #[serde(default)]
    pub max_targets: Option<usize>,
    /// Document prefetch worker threads.
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
    /// Maximum queued prefetch requests.
    #[serde(default = "default_fetch_queue_capacity")]
    pub fetch_queue_capacity: usize,
    /// Per-batch document retrieval timeout.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_smoothing_k() -> f64 {
    10.0
}

fn default_sketch_rows() -> usize {
    4
}

fn default_sketch_log_width() -> u32 {
    20
}

fn default_recent_limit() -> usize {
    1 << 14
}

fn default_common_limit() -> usize {
    1 << 22
}

fn default_decay() -> u32 {
    100
}

fn default_budget() -> usize {
    30
}

fn default_same_document_trigger() -> f64 {
    0.95
}

fn default_same_document_cosine() -> f64 {
    0.75
}

fn default_entity_threshold() -> f64 {
    1.5
}

fn default_situation_threshold() -> f64 {
    2.0
}

fn default_new_entity_bias() -> f64 {
    -1.0
}

fn default_seed_weight() -> f64 {
    30.0
}

fn default_seed_similarity_weight() -> f64 {
    5.0
}

fn default_ner_priors() -> BTreeMap<String, f64> {
    [
        ("PER", 0.5),
        ("PERSON", 0.5),
        ("GPE", 0.0),
        ("ORG", 0.0),
        ("ORGANIZATION", 0.0),
        ("MISC", -1.0),
        ("LOC", -1.0),
        ("LOCATION", -1.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_ner_prior() -> f64 {
    -4.0
}

fn default_max_word_freq_features() -> usize {
    9
}

fn default_word_freq_tolerance() -> f64 {
    0.01
}

fn default_rng_seed() -> u64 {
    9001
}

fn default_enqueue_pairs() -> bool {
    true
}

fn default_fetch_workers() -> usize {
    2
}

fn default_fetch_queue_capacity() -> usize {
    64
}

fn default_fetch_timeout_ms() -> u64 {
    2000
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            smoothing_k: default_smoothing_k(),
            sketch_rows: default_sketch_rows(),
            sketch_log_width: default_sketch_log_width(),
            reversible_recent_limit: default_recent_limit(),
            reversible_common_limit: default_common_limit(),
            reversible_decay: default_decay(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            same_document_trigger: default_same_document_trigger(),
            same_document_cosine: default_same_document_cosine(),
        }
    }
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            entity_link_threshold: default_entity_threshold(),
            situation_link_threshold: default_situation_threshold(),
            new_entity_bias: default_new_entity_bias(),
            seed_weight: default_seed_weight(),
            seed_similarity_weight: default_seed_similarity_weight(),
            default_ner_prior: default_ner_prior(),
            max_word_freq_features: default_max_word_freq_features(),
            word_freq_tolerance: default_word_freq_tolerance(),
            ner_priors: default_ner_priors(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            rng_seed: default_rng_seed(),
            enqueue_pairs: default_enqueue_pairs(),
            max_targets: None,
            fetch_workers: default_fetch_workers(),
            fetch_queue_capacity: default_fetch_queue_capacity(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl LinkingConfig {
    /// Returns the interestingness prior for a named-entity type.
    #[must_use]
    pub fn ner_prior(&self, ner_type: &str) -> f64 {
        self.ner_priors
            .get(ner_type)
            .copied()
            .unwrap_or(self.default_ner_prior)
    }
}

fn finite(field: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field: field.to_string(),
            value,
            reason: "must be finite".to_string(),
        })
    }
}

impl PkbConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> PkbResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> PkbResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(StorageError::from)?;
        Self::from_toml_str(&text)
    }

    /// Renders this configuration as TOML.
    pub fn to_toml_string(&self) -> PkbResult<String> {
        toml::to_string(self).map_err(|e| {
            StorageError::Serialization {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let f = &self.frequency;
        finite("frequency.smoothing_k", f.smoothing_k)?;
        if f.smoothing_k <= 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "frequency.smoothing_k".to_string(),
                value: f.smoothing_k,
                reason: "must be positive".to_string(),
            });
        }
        if f.sketch_rows == 0 || f.sketch_log_width == 0 || f.sketch_log_width > 30 {
            return Err(ValidationError::InvalidSketchShape {
                rows: f.sketch_rows,
                log_width: f.sketch_log_width,
            });
        }
        if f.reversible_recent_limit == 0 || f.reversible_common_limit == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "reversible hash limits must be positive".to_string(),
            });
        }

        let s = &self.search;
        finite("search.same_document_trigger", s.same_document_trigger)?;
        finite("search.same_document_cosine", s.same_document_cosine)?;
        if !(0.0..1.0).contains(&s.same_document_cosine) {
            return Err(ValidationError::OutOfRange {
                field: "search.same_document_cosine".to_string(),
                value: s.same_document_cosine,
                reason: "must be in [0, 1)".to_string(),
            });
        }

        let l = &self.linking;
        finite("linking.entity_link_threshold", l.entity_link_threshold)?;
        finite("linking.situation_link_threshold", l.situation_link_threshold)?;
        finite("linking.new_entity_bias", l.new_entity_bias)?;
        finite("linking.seed_weight", l.seed_weight)?;
        finite("linking.seed_similarity_weight", l.seed_similarity_weight)?;
        finite("linking.default_ner_prior", l.default_ner_prior)?;
        finite("linking.word_freq_tolerance", l.word_freq_tolerance)?;
        for (ner, prior) in &l.ner_priors {
            finite(&format!("linking.ner_priors.{ner}"), *prior)?;
        }

        if self.control.fetch_timeout_ms == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "control.fetch_timeout_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}
