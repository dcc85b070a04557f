//! Whisper decoding: timestamp grammar, segment parsing and token-level
//! alignment from cross-attentions.

mod alignment;
mod generation;
mod prompt;
mod timestamps;

pub use alignment::{TimestampAligner, dynamic_time_warping, median_filter};
pub use generation::{WhisperOutput, generate};
pub use prompt::{LANGUAGES, TASKS, init_forced_ids, language_token, task_token, with_prompt_ids};
pub use timestamps::{TimestampSegment, WhisperTimeStampLogitsProcessor, parse_timestamp_segments};

use crate::common::GenerationConfig;
use crate::models::ModelFamily;
use crate::processors::LogitsProcessor;

/// `<|endoftext|>`, also the first special token of the multilingual vocabulary.
pub const EOT_TOKEN: u32 = 50257;
/// `<|notimestamps|>`
pub const NO_TIMESTAMPS_TOKEN: u32 = 50363;
/// `<|0.00|>`
pub const TIMESTAMP_BEGIN: u32 = 50364;

/// Adds the timestamp grammar when timestamps are requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhisperFamily;

impl ModelFamily for WhisperFamily {
    fn name(&self) -> &'static str {
        "whisper"
    }

    fn logits_processors(
        &self,
        config: &GenerationConfig,
        begin_index: usize,
    ) -> Vec<Box<dyn LogitsProcessor>> {
        if !config.return_timestamps {
            return Vec::new();
        }
        let Some(no_timestamps) = config.no_timestamps_token_id else {
            return Vec::new();
        };
        let eos = config.eos_token_ids().first().copied().unwrap_or(EOT_TOKEN);

        vec![Box::new(WhisperTimeStampLogitsProcessor::new(
            eos,
            no_timestamps,
            begin_index,
            config.max_initial_timestamp_index,
        ))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TokenIds;

    #[test]
    fn test_no_processor_without_timestamps() {
        let config = GenerationConfig {
            no_timestamps_token_id: Some(NO_TIMESTAMPS_TOKEN),
            ..Default::default()
        };
        assert!(WhisperFamily.logits_processors(&config, 4).is_empty());
    }

    #[test]
    fn test_timestamp_processor_added() {
        let config = GenerationConfig {
            return_timestamps: true,
            no_timestamps_token_id: Some(NO_TIMESTAMPS_TOKEN),
            eos_token_id: Some(TokenIds::One(EOT_TOKEN)),
            ..Default::default()
        };
        let processors = WhisperFamily.logits_processors(&config, 4);
        assert_eq!(processors.len(), 1);
        assert_eq!(processors[0].name(), "whisper_timestamps");
    }
}
