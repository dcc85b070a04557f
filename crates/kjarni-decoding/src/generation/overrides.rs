//! Partial generation parameters.
//!
//! Used both for a model's declared `generation_config.json` and for
//! call-site overrides. These are never a full configuration on their own;
//! they are layered over base defaults at resolution time.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::common::{EarlyStopping, GenerationConfig, TokenIds};

/// Every [`GenerationConfig`] field, optional.
///
/// A `Some` value replaces the whole target field. List-valued fields are
/// replaced, never merged element by element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOverrides {
    pub max_length: Option<usize>,
    pub max_new_tokens: Option<usize>,
    pub min_length: Option<usize>,
    pub min_new_tokens: Option<usize>,
    pub max_time: Option<f64>,

    pub do_sample: Option<bool>,
    pub num_beams: Option<usize>,
    pub num_beam_groups: Option<usize>,
    pub early_stopping: Option<EarlyStopping>,
    pub diversity_penalty: Option<f32>,
    pub length_penalty: Option<f32>,
    pub use_cache: Option<bool>,
    pub num_return_sequences: Option<usize>,

    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub typical_p: Option<f32>,
    pub epsilon_cutoff: Option<f32>,
    pub eta_cutoff: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub no_repeat_ngram_size: Option<usize>,

    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<TokenIds>,
    pub forced_decoder_ids: Option<Vec<(usize, u32)>>,
    pub suppress_tokens: Option<Vec<u32>>,
    pub begin_suppress_tokens: Option<Vec<u32>>,
    pub bad_words_ids: Option<Vec<Vec<u32>>>,

    pub pad_token_id: Option<u32>,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<TokenIds>,
    pub decoder_start_token_id: Option<u32>,

    pub output_attentions: Option<bool>,
    pub output_scores: Option<bool>,
    pub return_dict_in_generate: Option<bool>,

    pub seed: Option<u64>,

    pub return_timestamps: Option<bool>,
    pub return_token_timestamps: Option<bool>,
    pub no_timestamps_token_id: Option<u32>,
    pub max_initial_timestamp_index: Option<usize>,
    pub alignment_heads: Option<Vec<(usize, usize)>>,
    pub num_frames: Option<usize>,
    pub time_precision: Option<f32>,
    pub median_filter_width: Option<usize>,
    pub task: Option<String>,
    pub language: Option<String>,
    pub is_multilingual: Option<bool>,
    pub lang_to_id: Option<HashMap<String, u32>>,
    pub task_to_id: Option<HashMap<String, u32>>,
    pub prompt_ids: Option<Vec<u32>>,
}

/// Copies each present override into a field that is not itself optional.
macro_rules! replace_fields {
    ($config:ident, $overrides:ident, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = &$overrides.$field {
                $config.$field = value.clone();
            }
        )*
    };
}

/// Copies each present override into an `Option` field.
macro_rules! replace_optional_fields {
    ($config:ident, $overrides:ident, [$($field:ident),* $(,)?]) => {
        $(
            if let Some(value) = &$overrides.$field {
                $config.$field = Some(value.clone());
            }
        )*
    };
}

impl GenerationOverrides {
    /// Greedy decoding.
    pub fn greedy() -> Self {
        Self {
            do_sample: Some(false),
            num_beams: Some(1),
            ..Default::default()
        }
    }

    /// Deterministic beam search with `num_beams` beams.
    pub fn beam_search(num_beams: usize) -> Self {
        Self {
            do_sample: Some(false),
            num_beams: Some(num_beams),
            ..Default::default()
        }
    }

    /// Multinomial sampling at `temperature`.
    pub fn sampling(temperature: f32) -> Self {
        Self {
            do_sample: Some(true),
            temperature: Some(temperature),
            ..Default::default()
        }
    }

    /// Parses a `generation_config.json` document. Unknown keys are ignored.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid generation config JSON")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Writes every present field into `config`.
    pub fn apply_to(&self, config: &mut GenerationConfig) {
        let overrides = self;
        replace_fields!(
            config,
            overrides,
            [
                max_length,
                min_length,
                do_sample,
                num_beams,
                num_beam_groups,
                early_stopping,
                diversity_penalty,
                length_penalty,
                use_cache,
                num_return_sequences,
                temperature,
                top_k,
                top_p,
                typical_p,
                epsilon_cutoff,
                eta_cutoff,
                repetition_penalty,
                no_repeat_ngram_size,
                output_attentions,
                output_scores,
                return_dict_in_generate,
                return_timestamps,
                return_token_timestamps,
                time_precision,
                median_filter_width,
                is_multilingual,
            ]
        );
        replace_optional_fields!(
            config,
            overrides,
            [
                max_new_tokens,
                min_new_tokens,
                max_time,
                forced_bos_token_id,
                forced_eos_token_id,
                forced_decoder_ids,
                suppress_tokens,
                begin_suppress_tokens,
                bad_words_ids,
                pad_token_id,
                bos_token_id,
                eos_token_id,
                decoder_start_token_id,
                seed,
                no_timestamps_token_id,
                max_initial_timestamp_index,
                alignment_heads,
                num_frames,
                task,
                language,
                lang_to_id,
                task_to_id,
                prompt_ids,
            ]
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_empty() {
        assert!(GenerationOverrides::default().is_empty());
        assert!(!GenerationOverrides::greedy().is_empty());
    }

    #[test]
    fn test_presets() {
        let beams = GenerationOverrides::beam_search(4);
        assert_eq!(beams.num_beams, Some(4));
        assert_eq!(beams.do_sample, Some(false));

        let sampling = GenerationOverrides::sampling(0.7);
        assert_eq!(sampling.do_sample, Some(true));
        assert_eq!(sampling.temperature, Some(0.7));
    }

    #[test]
    fn test_parse_hf_style_json() {
        let json = r#"{
            "bos_token_id": 50257,
            "eos_token_id": [50256, 50257],
            "decoder_start_token_id": 50258,
            "forced_decoder_ids": [[1, null], [2, 50359]],
            "early_stopping": "never",
            "transformers_version": "4.40.0"
        }"#;
        // forced_decoder_ids with null entries are not supported
        assert!(GenerationOverrides::from_json_str(json).is_err());

        let json = r#"{
            "bos_token_id": 50257,
            "eos_token_id": [50256, 50257],
            "forced_decoder_ids": [[1, 50259], [2, 50359]],
            "alignment_heads": [[3, 1], [4, 2]],
            "is_multilingual": true,
            "lang_to_id": {"<|en|>": 50259, "<|de|>": 50261},
            "task_to_id": {"transcribe": 50359, "translate": 50358},
            "early_stopping": "never",
            "transformers_version": "4.40.0"
        }"#;
        let overrides = GenerationOverrides::from_json_str(json).unwrap();
        assert_eq!(overrides.bos_token_id, Some(50257));
        assert_eq!(overrides.eos_token_id, Some(TokenIds::Many(vec![50256, 50257])));
        assert_eq!(overrides.forced_decoder_ids, Some(vec![(1, 50259), (2, 50359)]));
        assert_eq!(overrides.alignment_heads, Some(vec![(3, 1), (4, 2)]));
        assert_eq!(overrides.is_multilingual, Some(true));
        assert_eq!(overrides.lang_to_id.unwrap()["<|de|>"], 50261);
        assert_eq!(overrides.task_to_id.unwrap()["translate"], 50358);
        assert_eq!(overrides.early_stopping, Some(EarlyStopping::Never));
        assert_eq!(overrides.max_length, None);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_length": 64, "num_beams": 4, "eos_token_id": 2}}"#).unwrap();

        let overrides = GenerationOverrides::from_json_file(file.path()).unwrap();
        assert_eq!(overrides.max_length, Some(64));
        assert_eq!(overrides.num_beams, Some(4));
        assert_eq!(overrides.eos_token_id, Some(TokenIds::One(2)));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("generation_config.json");
        assert!(GenerationOverrides::from_json_file(&missing).is_err());
    }

    #[test]
    fn test_apply_replaces_whole_list() {
        let mut config = GenerationConfig::default();
        config.suppress_tokens = Some(vec![1, 2, 3]);

        let overrides = GenerationOverrides {
            suppress_tokens: Some(vec![9]),
            ..Default::default()
        };
        overrides.apply_to(&mut config);

        assert_eq!(config.suppress_tokens, Some(vec![9]));
    }
}
