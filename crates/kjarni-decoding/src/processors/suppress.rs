use ndarray::ArrayViewMut1;

use super::{LogitsProcessor, ban_tokens};

/// Bans `tokens` at every position up to and including `begin_index`, the
/// first position that is not forced.
pub struct SuppressTokensAtBeginLogitsProcessor {
    tokens: Vec<u32>,
    begin_index: usize,
}

impl SuppressTokensAtBeginLogitsProcessor {
    pub fn new(tokens: Vec<u32>, begin_index: usize) -> Self {
        Self {
            tokens,
            begin_index,
        }
    }
}

impl LogitsProcessor for SuppressTokensAtBeginLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        if input_ids.len() <= self.begin_index {
            ban_tokens(&mut scores, self.tokens.iter().copied());
        }
    }

    fn name(&self) -> &'static str {
        "suppress_tokens_at_begin"
    }
}

/// Bans `tokens` everywhere.
pub struct SuppressTokensLogitsProcessor {
    tokens: Vec<u32>,
}

impl SuppressTokensLogitsProcessor {
    pub fn new(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }
}

impl LogitsProcessor for SuppressTokensLogitsProcessor {
    fn process(&self, _input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        ban_tokens(&mut scores, self.tokens.iter().copied());
    }

    fn name(&self) -> &'static str {
        "suppress_tokens"
    }
}

/// Bans token sequences. A single-token entry is banned outright; a longer
/// entry bans its last token when the history ends with the rest of it.
pub struct NoBadWordsLogitsProcessor {
    bad_words_ids: Vec<Vec<u32>>,
}

impl NoBadWordsLogitsProcessor {
    pub fn new(bad_words_ids: Vec<Vec<u32>>) -> Self {
        Self {
            bad_words_ids: bad_words_ids.into_iter().filter(|w| !w.is_empty()).collect(),
        }
    }
}

impl LogitsProcessor for NoBadWordsLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        let banned = self.bad_words_ids.iter().filter_map(|word| {
            let (last, prefix) = word.split_last()?;
            input_ids.ends_with(prefix).then_some(*last)
        });
        ban_tokens(&mut scores, banned);
    }

    fn name(&self) -> &'static str {
        "no_bad_words"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    const NEG: f32 = f32::NEG_INFINITY;

    #[test]
    fn test_suppress_at_begin() {
        let processor = SuppressTokensAtBeginLogitsProcessor::new(vec![0, 2], 3);

        let mut s = Array1::from_vec(vec![1.0f32, 1.0, 1.0]);
        processor.process(&[5, 5, 5], s.view_mut());
        assert_eq!(s.to_vec(), vec![NEG, 1.0, NEG]);

        let mut s = Array1::from_vec(vec![1.0f32, 1.0, 1.0]);
        processor.process(&[5, 5, 5, 1], s.view_mut());
        assert_eq!(s.to_vec(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_suppress_everywhere() {
        let processor = SuppressTokensLogitsProcessor::new(vec![1, 42]);
        let mut s = Array1::from_vec(vec![1.0f32, 1.0, 1.0]);
        processor.process(&[0, 0, 0, 0, 0, 0], s.view_mut());
        assert_eq!(s.to_vec(), vec![1.0, NEG, 1.0]);
    }

    #[test]
    fn test_bad_words() {
        let processor = NoBadWordsLogitsProcessor::new(vec![vec![3], vec![1, 2], vec![]]);

        // prefix [1] matches, so 2 is banned; 3 always banned
        let mut s = Array1::from_vec(vec![0.0f32; 4]);
        processor.process(&[0, 1], s.view_mut());
        assert_eq!(s.to_vec(), vec![0.0, 0.0, NEG, NEG]);

        let mut s = Array1::from_vec(vec![0.0f32; 4]);
        processor.process(&[1, 0], s.view_mut());
        assert_eq!(s.to_vec(), vec![0.0, 0.0, 0.0, NEG]);
    }
}
