use crate::beams::StepAttentions;

/// Result of a generation call.
///
/// `Sequences` unless `return_dict_in_generate` is set. Sequences include
/// the prompt and are ordered by input row, `num_return_sequences`
/// consecutive entries per row, best first.
#[derive(Debug, Clone)]
pub enum GenerationOutput {
    Sequences(Vec<Vec<u32>>),
    Dict(GenerateDictOutput),
}

impl GenerationOutput {
    pub fn sequences(&self) -> &[Vec<u32>] {
        match self {
            GenerationOutput::Sequences(seqs) => seqs,
            GenerationOutput::Dict(dict) => &dict.sequences,
        }
    }

    pub fn into_sequences(self) -> Vec<Vec<u32>> {
        match self {
            GenerationOutput::Sequences(seqs) => seqs,
            GenerationOutput::Dict(dict) => dict.sequences,
        }
    }

    pub fn as_dict(&self) -> Option<&GenerateDictOutput> {
        match self {
            GenerationOutput::Dict(dict) => Some(dict),
            GenerationOutput::Sequences(_) => None,
        }
    }
}

/// Structured output, one entry per returned sequence in every field.
#[derive(Debug, Clone, Default)]
pub struct GenerateDictOutput {
    pub sequences: Vec<Vec<u32>>,
    /// Length-normalized cumulative log-probability.
    pub sequences_scores: Vec<f32>,
    /// Log-probability of each generated token, when `output_scores` is set.
    pub scores: Option<Vec<Vec<f32>>>,
    /// Decoder self-attentions per step, when `output_attentions` is set.
    /// Step 0 covers every prompt position, later steps the newest one.
    pub decoder_attentions: Option<Vec<Vec<StepAttentions>>>,
    /// Cross-attentions per step, shaped like `decoder_attentions`. Empty
    /// for decoder-only models.
    pub cross_attentions: Option<Vec<Vec<StepAttentions>>>,
    /// Number of prompt tokens at the start of each sequence.
    pub prompt_len: usize,
}

impl GenerateDictOutput {
    /// Generated part of sequence `idx`, prompt removed.
    pub fn generated_tokens(&self, idx: usize) -> &[u32] {
        self.sequences
            .get(idx)
            .map(|seq| &seq[self.prompt_len.min(seq.len())..])
            .unwrap_or(&[])
    }
}
