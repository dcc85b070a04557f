use std::collections::HashSet;

use ndarray::ArrayViewMut1;

use super::LogitsProcessor;

/// CTRL-style repetition penalty.
///
/// Each distinct token already in the history has its score divided by the
/// penalty when positive and multiplied by it otherwise. A penalty of 1.0
/// leaves scores untouched.
pub struct RepetitionPenaltyLogitsProcessor {
    penalty: f32,
}

impl RepetitionPenaltyLogitsProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for RepetitionPenaltyLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        if self.penalty == 1.0 {
            return;
        }
        let vocab = scores.len();
        let seen: HashSet<u32> = input_ids.iter().copied().collect();
        for token in seen {
            let idx = token as usize;
            if idx >= vocab {
                continue;
            }
            let score = scores[idx];
            scores[idx] = if score > 0.0 {
                score / self.penalty
            } else {
                score * self.penalty
            };
        }
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn test_sign_aware_penalty() {
        let processor = RepetitionPenaltyLogitsProcessor::new(2.0);
        let mut scores = Array1::from_vec(vec![4.0f32, -4.0, 1.0, 0.0]);

        processor.process(&[0, 1, 1, 1, 3], scores.view_mut());

        assert_abs_diff_eq!(scores[0], 2.0);
        // repeated occurrences penalize once
        assert_abs_diff_eq!(scores[1], -8.0);
        assert_abs_diff_eq!(scores[2], 1.0);
        assert_abs_diff_eq!(scores[3], 0.0);
    }

    #[test]
    fn test_unit_penalty_is_identity() {
        let processor = RepetitionPenaltyLogitsProcessor::new(1.0);
        let unpenalized = Array1::from_vec(vec![0.3f32, -1.7, 2.5, -0.0, 9.1]);
        let mut scores = unpenalized.clone();

        processor.process(&[0, 1, 2, 3, 4, 4, 2], scores.view_mut());

        assert_eq!(scores, unpenalized);
    }

    #[test]
    fn test_out_of_vocab_history_ignored() {
        let processor = RepetitionPenaltyLogitsProcessor::new(1.5);
        let mut scores = Array1::from_vec(vec![3.0f32]);
        processor.process(&[7], scores.view_mut());
        assert_eq!(scores[0], 3.0);
    }
}
