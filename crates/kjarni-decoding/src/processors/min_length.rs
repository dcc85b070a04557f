use ndarray::ArrayViewMut1;

use super::{LogitsProcessor, ban_tokens};

/// Bans every EOS id while the whole sequence is shorter than `min_length`.
pub struct MinLengthLogitsProcessor {
    min_length: usize,
    eos_token_ids: Vec<u32>,
}

impl MinLengthLogitsProcessor {
    pub fn new(min_length: usize, eos_token_ids: Vec<u32>) -> Self {
        Self {
            min_length,
            eos_token_ids,
        }
    }
}

impl LogitsProcessor for MinLengthLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        if input_ids.len() < self.min_length {
            ban_tokens(&mut scores, self.eos_token_ids.iter().copied());
        }
    }

    fn name(&self) -> &'static str {
        "min_length"
    }
}

/// Bans every EOS id until `min_new_tokens` tokens follow the prompt.
pub struct MinNewTokensLengthLogitsProcessor {
    prompt_length_to_skip: usize,
    min_new_tokens: usize,
    eos_token_ids: Vec<u32>,
}

impl MinNewTokensLengthLogitsProcessor {
    pub fn new(prompt_length_to_skip: usize, min_new_tokens: usize, eos_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_length_to_skip,
            min_new_tokens,
            eos_token_ids,
        }
    }
}

impl LogitsProcessor for MinNewTokensLengthLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        let generated = input_ids.len().saturating_sub(self.prompt_length_to_skip);
        if generated < self.min_new_tokens {
            ban_tokens(&mut scores, self.eos_token_ids.iter().copied());
        }
    }

    fn name(&self) -> &'static str {
        "min_new_tokens_length"
    }
}
