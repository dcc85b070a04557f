//! The single-step compute contract the engine consumes from a model.
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use ndarray::{Array2, Array4, ArrayD, Ix2, Ix3, s};

use crate::cache::{CacheLayout, PastKeyValues};
use crate::generation::GenerationOverrides;

/// Static facts about a model the engine needs before the first step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// Registry key, e.g. `"gpt2"` or `"whisper"`.
    pub model_type: String,
    pub vocab_size: usize,
    /// Layers, heads and head size of the decoder cache.
    pub cache_layout: CacheLayout,
}

/// Inputs of one batched decoding step. Row `i` of every tensor belongs
/// to the same beam.
#[derive(Debug)]
pub struct StepInput<'a> {
    /// `[beams, seq]`: the full prompt on the first step (or whenever the
    /// cache is disabled), the single newest token otherwise.
    pub input_ids: Array2<u32>,
    /// `[beams, total_len]`, covering cached and new positions.
    pub attention_mask: Array2<u32>,
    /// Zero-length on the first step.
    pub past_key_values: &'a PastKeyValues,
    pub output_attentions: bool,
    /// Index of the decoding step, starting at 0.
    pub step: usize,
}

/// Outputs of one batched decoding step.
#[derive(Debug)]
pub struct StepOutput {
    /// `[beams, vocab]` or `[beams, seq, vocab]`. Only the last position is
    /// read.
    pub logits: ArrayD<f32>,
    /// Cache extended by this step's positions.
    pub past_key_values: PastKeyValues,
    /// Per-layer `[beams, heads, query_len, key_len]`, when requested.
    pub decoder_attentions: Option<Vec<Array4<f32>>>,
    /// Per-layer `[beams, heads, query_len, encoder_len]`, when requested.
    pub cross_attentions: Option<Vec<Array4<f32>>>,
}

impl StepOutput {
    /// Next-token scores `[beams, vocab]` taken from the last position.
    pub fn next_token_scores(&self, expected_rows: usize) -> Result<Array2<f32>> {
        let scores = match self.logits.ndim() {
            2 => self
                .logits
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|e| anyhow!("invalid logits: {}", e))?
                .to_owned(),
            3 => {
                let logits = self
                    .logits
                    .view()
                    .into_dimensionality::<Ix3>()
                    .map_err(|e| anyhow!("invalid logits: {}", e))?;
                if logits.shape()[1] == 0 {
                    bail!("logits have no positions");
                }
                logits.slice(s![.., -1, ..]).to_owned()
            }
            n => bail!("logits must be 2-D or 3-D, got {}-D", n),
        };
        if scores.nrows() != expected_rows {
            bail!("logits have {} rows for {} beams", scores.nrows(), expected_rows);
        }
        Ok(scores)
    }
}

/// A model that can run one decoding step.
///
/// Implementations own everything outside the decoder loop: weights,
/// encoder outputs for encoder-decoder models, device placement. The call
/// may suspend; the engine awaits exactly one call per step.
#[async_trait]
pub trait StepModel: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    /// The model's declared generation defaults, usually read from its
    /// `generation_config.json`.
    fn generation_config(&self) -> GenerationOverrides {
        GenerationOverrides::default()
    }

    async fn forward_step(&self, input: StepInput<'_>) -> Result<StepOutput>;
}
