//! Shared types for the decoding engine: the generation parameter bag,
//! cancellation and small numeric helpers.

pub mod cancellation;
pub mod math;

pub use cancellation::{CancellationHandle, CancellationToken, StopReason, StepBudget};

use std::collections::HashMap;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Default Whisper encoder frame duration in seconds.
pub const DEFAULT_TIME_PRECISION: f32 = 0.02;

/// Default median filter width applied to alignment-head attentions.
pub const DEFAULT_MEDIAN_FILTER_WIDTH: usize = 7;

/// When beam search may stop before reaching the length cap.
///
/// Serialized the way `generation_config.json` files spell it:
/// `true`, `false` or `"never"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EarlyStopping {
    /// `true`: stop once `num_beams` hypotheses are complete.
    Always,
    /// `false`: stop when the best active beam can no longer beat the worst
    /// kept hypothesis at the current length.
    #[default]
    Heuristic,
    /// `"never"`: stop only when no active beam can beat the worst kept
    /// hypothesis at any reachable length.
    Never,
}

impl Serialize for EarlyStopping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EarlyStopping::Always => serializer.serialize_bool(true),
            EarlyStopping::Heuristic => serializer.serialize_bool(false),
            EarlyStopping::Never => serializer.serialize_str("never"),
        }
    }
}

impl<'de> Deserialize<'de> for EarlyStopping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Word(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Flag(true) => Ok(EarlyStopping::Always),
            Repr::Flag(false) => Ok(EarlyStopping::Heuristic),
            Repr::Word(w) if w == "never" => Ok(EarlyStopping::Never),
            Repr::Word(other) => Err(de::Error::custom(format!(
                "early_stopping must be true, false or \"never\", got \"{}\"",
                other
            ))),
        }
    }
}

impl From<bool> for EarlyStopping {
    fn from(flag: bool) -> Self {
        if flag {
            EarlyStopping::Always
        } else {
            EarlyStopping::Heuristic
        }
    }
}

/// A token id field that model configs write either as a scalar or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::One(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }

    pub fn contains(&self, token: u32) -> bool {
        match self {
            TokenIds::One(id) => *id == token,
            TokenIds::Many(ids) => ids.contains(&token),
        }
    }

    pub fn first(&self) -> Option<u32> {
        match self {
            TokenIds::One(id) => Some(*id),
            TokenIds::Many(ids) => ids.first().copied(),
        }
    }
}

impl From<u32> for TokenIds {
    fn from(id: u32) -> Self {
        TokenIds::One(id)
    }
}

impl From<Vec<u32>> for TokenIds {
    fn from(ids: Vec<u32>) -> Self {
        TokenIds::Many(ids)
    }
}

/// Decoding strategy, derived from the flat config fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingStrategy {
    /// Argmax at every step.
    Greedy,
    /// Multinomial sampling with a single beam.
    Sample,
    /// Deterministic beam search.
    BeamSearch { num_beams: usize },
    /// Beam search with sampled expansions.
    BeamSample { num_beams: usize },
    /// Diverse beam search over `num_beam_groups` groups.
    GroupBeamSearch {
        num_beams: usize,
        num_beam_groups: usize,
    },
}

/// Every option the decoding engine recognizes, fully populated.
///
/// Built by [`crate::generation::resolve_generation_config`] from base
/// defaults, the model's declared config and call-site overrides. Values
/// outside their meaningful range are tolerated here and treated as no-ops
/// by the components that read them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    // Length control
    pub max_length: usize,
    pub max_new_tokens: Option<usize>,
    pub min_length: usize,
    pub min_new_tokens: Option<usize>,
    /// Wall-clock budget in seconds, checked between steps.
    pub max_time: Option<f64>,

    // Search strategy
    pub do_sample: bool,
    pub num_beams: usize,
    pub num_beam_groups: usize,
    pub early_stopping: EarlyStopping,
    pub diversity_penalty: f32,
    pub length_penalty: f32,
    pub use_cache: bool,
    pub num_return_sequences: usize,

    // Sampling shape
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub typical_p: f32,
    pub epsilon_cutoff: f32,
    pub eta_cutoff: f32,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,

    // Forced and suppressed vocabulary
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<TokenIds>,
    /// `(position, token)` pairs; position is the absolute sequence index.
    pub forced_decoder_ids: Option<Vec<(usize, u32)>>,
    pub suppress_tokens: Option<Vec<u32>>,
    pub begin_suppress_tokens: Option<Vec<u32>>,
    pub bad_words_ids: Option<Vec<Vec<u32>>>,

    // Special token ids
    pub pad_token_id: Option<u32>,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<TokenIds>,
    pub decoder_start_token_id: Option<u32>,

    // Output shape
    pub output_attentions: bool,
    pub output_scores: bool,
    pub return_dict_in_generate: bool,

    /// Seed for the sampling RNG. `None` draws from OS entropy.
    pub seed: Option<u64>,

    // Whisper family. Ignored by models that do not register a timestamp
    // processor.
    pub return_timestamps: bool,
    pub return_token_timestamps: bool,
    pub no_timestamps_token_id: Option<u32>,
    pub max_initial_timestamp_index: Option<usize>,
    /// `(layer, head)` pairs whose cross attentions track the audio.
    pub alignment_heads: Option<Vec<(usize, usize)>>,
    pub num_frames: Option<usize>,
    pub time_precision: f32,
    pub median_filter_width: usize,
    /// `transcribe` or `translate`.
    pub task: Option<String>,
    /// `<|en|>`, `en` or `english`.
    pub language: Option<String>,
    pub is_multilingual: bool,
    pub lang_to_id: Option<HashMap<String, u32>>,
    pub task_to_id: Option<HashMap<String, u32>>,
    /// Previous-text context placed before the decoder prompt, usually
    /// starting with `<|startofprev|>`.
    pub prompt_ids: Option<Vec<u32>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            max_new_tokens: None,
            min_length: 0,
            min_new_tokens: None,
            max_time: None,

            do_sample: false,
            num_beams: 1,
            num_beam_groups: 1,
            early_stopping: EarlyStopping::Heuristic,
            diversity_penalty: 0.0,
            length_penalty: 1.0,
            use_cache: true,
            num_return_sequences: 1,

            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            typical_p: 1.0,
            epsilon_cutoff: 0.0,
            eta_cutoff: 0.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,

            forced_bos_token_id: None,
            forced_eos_token_id: None,
            forced_decoder_ids: None,
            suppress_tokens: None,
            begin_suppress_tokens: None,
            bad_words_ids: None,

            pad_token_id: None,
            bos_token_id: None,
            eos_token_id: None,
            decoder_start_token_id: None,

            output_attentions: false,
            output_scores: false,
            return_dict_in_generate: false,

            seed: None,

            return_timestamps: false,
            return_token_timestamps: false,
            no_timestamps_token_id: None,
            max_initial_timestamp_index: None,
            alignment_heads: None,
            num_frames: None,
            time_precision: DEFAULT_TIME_PRECISION,
            median_filter_width: DEFAULT_MEDIAN_FILTER_WIDTH,
            task: None,
            language: None,
            is_multilingual: false,
            lang_to_id: None,
            task_to_id: None,
            prompt_ids: None,
        }
    }
}

impl GenerationConfig {
    /// Strategy implied by `do_sample`, `num_beams` and `num_beam_groups`.
    pub fn strategy(&self) -> DecodingStrategy {
        let num_beams = self.num_beams.max(1);
        if num_beams == 1 {
            if self.do_sample {
                DecodingStrategy::Sample
            } else {
                DecodingStrategy::Greedy
            }
        } else if self.num_beam_groups > 1 {
            DecodingStrategy::GroupBeamSearch {
                num_beams,
                num_beam_groups: self.num_beam_groups,
            }
        } else if self.do_sample {
            DecodingStrategy::BeamSample { num_beams }
        } else {
            DecodingStrategy::BeamSearch { num_beams }
        }
    }

    /// Absolute length cap for a prompt of `prompt_len` tokens.
    ///
    /// `max_new_tokens` wins over `max_length` when both are present.
    pub fn effective_max_length(&self, prompt_len: usize) -> usize {
        match self.max_new_tokens {
            Some(n) => prompt_len + n,
            None => self.max_length,
        }
    }

    /// Beams per diversity group.
    pub fn group_size(&self) -> usize {
        (self.num_beams.max(1) / self.num_beam_groups.max(1)).max(1)
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }

    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_id
            .as_ref()
            .map(|ids| ids.contains(token))
            .unwrap_or(false)
    }
}
