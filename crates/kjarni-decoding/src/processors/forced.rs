use std::collections::HashMap;

use ndarray::ArrayViewMut1;

use super::LogitsProcessor;

/// Leaves only `tokens` selectable: everything else becomes `-inf`, the
/// forced ids become 0.
fn force_only(scores: &mut ArrayViewMut1<'_, f32>, tokens: &[u32]) {
    scores.fill(f32::NEG_INFINITY);
    let vocab = scores.len();
    for &token in tokens {
        let idx = token as usize;
        if idx < vocab {
            scores[idx] = 0.0;
        }
    }
}

/// Forces exact tokens at fixed absolute positions of the sequence.
///
/// Position `p` is forced when the history holds exactly `p` tokens.
pub struct ForceTokensLogitsProcessor {
    forced: HashMap<usize, u32>,
}

impl ForceTokensLogitsProcessor {
    pub fn new(forced: impl IntoIterator<Item = (usize, u32)>) -> Self {
        Self {
            forced: forced.into_iter().collect(),
        }
    }
}

impl LogitsProcessor for ForceTokensLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        if let Some(&token) = self.forced.get(&input_ids.len()) {
            force_only(&mut scores, &[token]);
        }
    }

    fn name(&self) -> &'static str {
        "force_tokens"
    }
}

/// Forces `bos_token_id` as the first generated token.
pub struct ForcedBOSLogitsProcessor {
    bos_token_id: u32,
    prompt_len: usize,
}

impl ForcedBOSLogitsProcessor {
    pub fn new(bos_token_id: u32, prompt_len: usize) -> Self {
        Self {
            bos_token_id,
            prompt_len,
        }
    }
}

impl LogitsProcessor for ForcedBOSLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        if input_ids.len() == self.prompt_len {
            force_only(&mut scores, &[self.bos_token_id]);
        }
    }

    fn name(&self) -> &'static str {
        "forced_bos"
    }
}

/// Forces one of the EOS ids as the last token allowed by `max_length`.
pub struct ForcedEOSLogitsProcessor {
    max_length: usize,
    eos_token_ids: Vec<u32>,
}

impl ForcedEOSLogitsProcessor {
    pub fn new(max_length: usize, eos_token_ids: Vec<u32>) -> Self {
        Self {
            max_length,
            eos_token_ids,
        }
    }
}

impl LogitsProcessor for ForcedEOSLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        if self.max_length > 0 && input_ids.len() == self.max_length - 1 {
            force_only(&mut scores, &self.eos_token_ids);
        }
    }

    fn name(&self) -> &'static str {
        "forced_eos"
    }
}
