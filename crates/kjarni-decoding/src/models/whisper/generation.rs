use ndarray::Array2;

use super::prompt::{init_forced_ids, with_prompt_ids};
use super::{EOT_TOKEN, TimestampAligner, TimestampSegment, parse_timestamp_segments};
use crate::error::{GenerationError, GenerationResult};
use crate::generator::{GenerateOptions, GenerationOutput, Generator};

/// Transcription output: sequences plus the timing information that was
/// requested.
#[derive(Debug, Clone)]
pub struct WhisperOutput {
    /// Prompt included, ordered like [`GenerationOutput::sequences`].
    pub sequences: Vec<Vec<u32>>,
    /// Seconds, one per position of the matching sequence, when
    /// `return_token_timestamps` is set.
    pub token_timestamps: Option<Vec<Vec<f32>>>,
    /// Timed text of each sequence's generated tokens, when
    /// `return_timestamps` is set.
    pub segments: Option<Vec<Vec<TimestampSegment>>>,
    pub output: GenerationOutput,
}

/// Runs [`Generator::generate`] and derives Whisper timing from the result.
///
/// `input_ids` start with the decoder start token. `prompt_ids` are placed
/// in front of them, and the language, task and `<|notimestamps|>` tokens
/// are forced right after them. Token timestamps need the cross-attentions
/// of every step, so `output_attentions` and `return_dict_in_generate` are
/// switched on for the call when `return_token_timestamps` is set.
pub async fn generate(
    generator: &Generator,
    input_ids: &Array2<u32>,
    mut options: GenerateOptions,
) -> GenerationResult<WhisperOutput> {
    let config = generator.resolve_config(options.config.as_ref()).into_inner();
    let input_ids = with_prompt_ids(input_ids, config.prompt_ids.as_deref())?;
    let prompt_len = input_ids.ncols();
    // segments are read from the first token after the forced ones
    let mut text_start = prompt_len;
    if let Some(forced) = init_forced_ids(&config, prompt_len)? {
        log::debug!("whisper forced decoder ids: {:?}", forced);
        text_start += forced.len();
        let overrides = options.config.get_or_insert_with(Default::default);
        overrides.forced_decoder_ids = Some(forced);
    }

    let aligner = if config.return_token_timestamps {
        let overrides = options.config.get_or_insert_with(Default::default);
        overrides.output_attentions = Some(true);
        overrides.return_dict_in_generate = Some(true);
        Some(TimestampAligner::from_config(&config)?)
    } else {
        None
    };

    let output = generator.generate(&input_ids, options).await?;
    let sequences = output.sequences().to_vec();

    let token_timestamps = match aligner {
        Some(aligner) => {
            let cross_attentions = output
                .as_dict()
                .and_then(|dict| dict.cross_attentions.as_ref())
                .ok_or_else(|| {
                    GenerationError::Alignment("the model returned no cross attentions".into())
                })?;
            let timestamps = sequences
                .iter()
                .zip(cross_attentions)
                .map(|(seq, steps)| {
                    aligner.extract_token_timestamps(steps, seq.len(), config.num_frames)
                })
                .collect::<GenerationResult<Vec<_>>>()?;
            Some(timestamps)
        }
        None => None,
    };

    let segments = match (config.return_timestamps, config.no_timestamps_token_id) {
        (true, Some(no_timestamps)) => {
            let first_special = config.eos_token_ids().first().copied().unwrap_or(EOT_TOKEN);
            Some(
                sequences
                    .iter()
                    .map(|seq| {
                        parse_timestamp_segments(
                            &seq[text_start.min(seq.len())..],
                            no_timestamps + 1,
                            first_special,
                            config.time_precision,
                        )
                    })
                    .collect(),
            )
        }
        _ => None,
    };

    log::debug!(
        "whisper generate: {} sequences, token timestamps: {}, segments: {}",
        sequences.len(),
        token_timestamps.is_some(),
        segments.is_some()
    );

    Ok(WhisperOutput {
        sequences,
        token_timestamps,
        segments,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::Result;
    use approx::assert_abs_diff_eq;
    use async_trait::async_trait;
    use ndarray::{Array4, array};

    use crate::cache::{CacheLayout, PastKeyValues};
    use crate::common::TokenIds;
    use crate::generation::GenerationOverrides;
    use crate::traits::{ModelSpec, StepInput, StepModel, StepOutput};

    // text 0..4, eos 4, <|notimestamps|> 5, timestamps 6..12
    const VOCAB: usize = 12;
    const FRAMES: usize = 20;

    /// Emits `script` after the prompt, then eos. Cross attention of
    /// position `t` sits around frame `3 * t`.
    struct ScriptedWhisper {
        spec: ModelSpec,
        prompt_len: usize,
        script: Vec<u32>,
    }

    impl ScriptedWhisper {
        fn new(prompt_len: usize, script: Vec<u32>) -> Self {
            Self {
                spec: ModelSpec {
                    model_type: "whisper".to_string(),
                    vocab_size: VOCAB,
                    cache_layout: CacheLayout {
                        num_layers: 1,
                        num_heads: 1,
                        head_dim: 1,
                    },
                },
                prompt_len,
                script,
            }
        }
    }

    #[async_trait]
    impl StepModel for ScriptedWhisper {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        fn generation_config(&self) -> GenerationOverrides {
            GenerationOverrides {
                eos_token_id: Some(TokenIds::One(4)),
                no_timestamps_token_id: Some(5),
                max_length: Some(16),
                ..Default::default()
            }
        }

        async fn forward_step(&self, input: StepInput<'_>) -> Result<StepOutput> {
            let (beams, new_len) = input.input_ids.dim();
            let past_len = input.past_key_values.seq_len();
            let total = past_len + new_len;

            let next = self.script.get(total - self.prompt_len).copied().unwrap_or(4);
            let logits = Array2::from_shape_fn((beams, VOCAB), |(_, v)| {
                if v == next as usize { 10.0 } else { 0.0 }
            });
            let keys = Array4::<f32>::zeros((beams, 1, total, 1));

            let cross_attentions = input.output_attentions.then(|| {
                vec![Array4::from_shape_fn((beams, 2, new_len, FRAMES), |(_, _, q, f)| {
                    let d = f as f32 - 3.0 * (past_len + q) as f32;
                    (-d * d / 8.0).exp()
                })]
            });
            let decoder_attentions = input
                .output_attentions
                .then(|| vec![Array4::from_elem((beams, 1, new_len, total), 1.0 / total as f32)]);

            Ok(StepOutput {
                logits: logits.into_dyn(),
                past_key_values: PastKeyValues::new(vec![(keys.clone(), keys)], beams)?,
                decoder_attentions,
                cross_attentions,
            })
        }
    }

    fn generator() -> Generator {
        Generator::new(Arc::new(ScriptedWhisper::new(2, vec![6, 1, 2, 8, 4])))
    }

    #[tokio::test]
    async fn test_segments_from_timestamp_tokens() {
        let options = GenerateOptions::with_config(GenerationOverrides {
            return_timestamps: Some(true),
            ..Default::default()
        });

        let output = generate(&generator(), &array![[0, 3]], options).await.unwrap();

        assert_eq!(output.sequences, vec![vec![0, 3, 6, 1, 2, 8, 4]]);
        assert!(output.token_timestamps.is_none());
        let segments = output.segments.unwrap();
        assert_eq!(segments[0].len(), 1);
        assert_abs_diff_eq!(segments[0][0].start, 0.0);
        assert_abs_diff_eq!(segments[0][0].end.unwrap(), 0.04, epsilon = 1e-6);
        assert_eq!(segments[0][0].tokens, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_timestamp_grammar_overrides_model() {
        // the model wants text first, the grammar forces an opening timestamp
        let generator = Generator::new(Arc::new(ScriptedWhisper::new(2, vec![1, 1, 1])));
        let options = GenerateOptions::with_config(GenerationOverrides {
            return_timestamps: Some(true),
            max_new_tokens: Some(2),
            ..Default::default()
        });

        let output = generate(&generator, &array![[0, 3]], options).await.unwrap();

        let first = output.sequences[0][2];
        assert!(first >= 6, "expected a timestamp, got {}", first);
        assert_eq!(output.sequences[0][3], 1);
    }

    #[tokio::test]
    async fn test_token_timestamps() {
        let options = GenerateOptions::with_config(GenerationOverrides {
            return_token_timestamps: Some(true),
            alignment_heads: Some(vec![(0, 0), (0, 1)]),
            num_frames: Some(2 * FRAMES),
            ..Default::default()
        });

        let output = generate(&generator(), &array![[0, 3]], options).await.unwrap();

        assert!(output.output.as_dict().is_some());
        let timestamps = &output.token_timestamps.unwrap()[0];
        assert_eq!(timestamps.len(), output.sequences[0].len());
        assert_abs_diff_eq!(timestamps[0], 0.0);
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(timestamps.iter().all(|&t| t <= 2.0 * FRAMES as f32 * 0.02));
        assert!(timestamps.last().unwrap() > &timestamps[2]);
    }

    fn multilingual(language: &str, task: &str) -> GenerationOverrides {
        GenerationOverrides {
            is_multilingual: Some(true),
            language: Some(language.to_string()),
            task: Some(task.to_string()),
            lang_to_id: Some(HashMap::from([
                ("<|en|>".to_string(), 2),
                ("<|de|>".to_string(), 3),
            ])),
            task_to_id: Some(HashMap::from([
                ("transcribe".to_string(), 0),
                ("translate".to_string(), 1),
            ])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_language_task_and_prompt_ids() {
        // prompt [2, 3] + start token 0; the model would keep emitting 6
        let generator = Generator::new(Arc::new(ScriptedWhisper::new(3, vec![6, 6, 6, 1, 2])));
        let options = GenerateOptions::with_config(GenerationOverrides {
            prompt_ids: Some(vec![2, 3]),
            ..multilingual("german", "translate")
        });

        let output = generate(&generator, &array![[0]], options).await.unwrap();

        // <|de|>, <|translate|>, <|notimestamps|>, then the model's text
        assert_eq!(output.sequences, vec![vec![2, 3, 0, 3, 1, 5, 1, 2, 4]]);
    }

    #[tokio::test]
    async fn test_segments_start_after_forced_tokens() {
        let generator = Generator::new(Arc::new(ScriptedWhisper::new(1, vec![9, 9, 6, 1, 2, 8, 4])));
        let options = GenerateOptions::with_config(GenerationOverrides {
            return_timestamps: Some(true),
            ..multilingual("<|en|>", "transcribe")
        });

        let output = generate(&generator, &array![[0]], options).await.unwrap();

        assert_eq!(output.sequences, vec![vec![0, 2, 0, 6, 1, 2, 8, 4]]);
        let segments = output.segments.unwrap();
        assert_eq!(segments[0].len(), 1);
        assert_eq!(segments[0][0].tokens, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unknown_language_or_task_is_rejected() {
        for overrides in [multilingual("klingon", "transcribe"), multilingual("en", "summarize")] {
            let err = generate(&generator(), &array![[0, 3]], GenerateOptions::with_config(overrides))
                .await
                .unwrap_err();
            assert!(matches!(err, GenerationError::Configuration(_)));
        }
    }

    #[tokio::test]
    async fn test_token_timestamps_need_alignment_heads() {
        let options = GenerateOptions::with_config(GenerationOverrides {
            return_token_timestamps: Some(true),
            ..Default::default()
        });

        let err = generate(&generator(), &array![[0, 3]], options).await.unwrap_err();
        assert!(matches!(err, GenerationError::Configuration(_)));
    }
}
