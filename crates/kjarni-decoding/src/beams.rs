//! Beam state, completed-hypothesis pools and candidate ranking.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{Array4, ArrayViewMut1};

use crate::common::EarlyStopping;
use crate::common::math::cmp_scores_desc;

/// Per-layer attention weights recorded for one decoding step, each
/// `[1, heads, query_len, key_len]`.
pub type StepAttentions = Arc<Vec<Array4<f32>>>;

/// Stable identity of a beam for the lifetime of one generation call.
/// Also the key of the beam's cache row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeamId(pub u64);

impl fmt::Display for BeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One hypothesis in flight.
#[derive(Debug, Clone)]
pub struct Beam {
    pub id: BeamId,
    /// Index of the input example this beam decodes.
    pub batch_id: usize,
    /// Diversity group under grouped beam search.
    pub group_id: usize,
    /// Prompt followed by every generated token.
    pub sequence: Vec<u32>,
    /// Sum of the chosen tokens' log-probabilities.
    pub score: f32,
    pub is_done: bool,
    /// Log-probability of each generated token.
    pub token_scores: Vec<f32>,
    pub attention_mask: Vec<u32>,
    pub decoder_attentions: Vec<StepAttentions>,
    pub cross_attentions: Vec<StepAttentions>,
}

impl Beam {
    pub fn new(id: BeamId, batch_id: usize, group_id: usize, prompt: Vec<u32>, attention_mask: Vec<u32>) -> Self {
        Self {
            id,
            batch_id,
            group_id,
            sequence: prompt,
            score: 0.0,
            is_done: false,
            token_scores: Vec::new(),
            attention_mask,
            decoder_attentions: Vec::new(),
            cross_attentions: Vec::new(),
        }
    }

    /// Key of this beam's cache row in the [`crate::cache::CacheManager`].
    pub fn cache_handle(&self) -> BeamId {
        self.id
    }

    /// A child extending this beam by `token`. Attention history is shared,
    /// not copied.
    pub fn extend(&self, id: BeamId, token: u32, log_prob: f32, score: f32) -> Self {
        let mut sequence = Vec::with_capacity(self.sequence.len() + 1);
        sequence.extend_from_slice(&self.sequence);
        sequence.push(token);

        let mut token_scores = self.token_scores.clone();
        token_scores.push(log_prob);

        let mut attention_mask = self.attention_mask.clone();
        attention_mask.push(1);

        Self {
            id,
            batch_id: self.batch_id,
            group_id: self.group_id,
            sequence,
            score,
            is_done: false,
            token_scores,
            attention_mask,
            decoder_attentions: self.decoder_attentions.clone(),
            cross_attentions: self.cross_attentions.clone(),
        }
    }

    pub fn last_token(&self) -> Option<u32> {
        self.sequence.last().copied()
    }

    /// Score divided by `generated_len ^ length_penalty`.
    pub fn normalized_score(&self, length_penalty: f32, prompt_len: usize) -> f32 {
        length_normalized(self.score, self.sequence.len().saturating_sub(prompt_len), length_penalty)
    }
}

fn length_normalized(score: f32, generated_len: usize, length_penalty: f32) -> f32 {
    if generated_len == 0 {
        return score;
    }
    score / (generated_len as f32).powf(length_penalty)
}

/// A completed beam and its length-normalized score.
#[derive(Debug, Clone)]
pub struct BeamHypothesis {
    pub beam: Beam,
    pub normalized_score: f32,
}

/// The best `capacity` completed hypotheses of one beam group.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    hypotheses: Vec<BeamHypothesis>,
    capacity: usize,
    length_penalty: f32,
    prompt_len: usize,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(capacity: usize, length_penalty: f32, prompt_len: usize) -> Self {
        Self {
            hypotheses: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            length_penalty,
            prompt_len,
            worst_score: f32::INFINITY,
        }
    }

    /// Adds a completed beam if it ranks among the best `capacity`. On
    /// equal scores the earlier hypothesis stays ahead.
    pub fn add(&mut self, mut beam: Beam) {
        if beam.score == f32::NEG_INFINITY {
            return;
        }
        beam.is_done = true;
        let score = beam.normalized_score(self.length_penalty, self.prompt_len);

        if self.hypotheses.len() < self.capacity || score > self.worst_score {
            let pos = self
                .hypotheses
                .iter()
                .position(|h| h.normalized_score < score)
                .unwrap_or(self.hypotheses.len());
            self.hypotheses.insert(
                pos,
                BeamHypothesis {
                    beam,
                    normalized_score: score,
                },
            );
            self.hypotheses.truncate(self.capacity);
            self.worst_score = self
                .hypotheses
                .last()
                .map(|h| h.normalized_score)
                .unwrap_or(f32::INFINITY);
        }
    }

    pub fn len(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.hypotheses.len() >= self.capacity
    }

    pub fn worst_score(&self) -> f32 {
        self.worst_score
    }

    /// Whether no active beam can still enter the pool.
    ///
    /// `best_active_score` is the highest raw score among the group's
    /// active beams, `cur_len` their current length and `max_length` the
    /// length cap of the call.
    pub fn is_done(
        &self,
        early_stopping: EarlyStopping,
        best_active_score: f32,
        cur_len: usize,
        max_length: usize,
    ) -> bool {
        if !self.is_full() {
            return false;
        }
        let generated = cur_len.saturating_sub(self.prompt_len);
        let bound_len = match early_stopping {
            EarlyStopping::Always => return true,
            EarlyStopping::Heuristic => generated,
            EarlyStopping::Never if self.length_penalty > 0.0 => {
                max_length.saturating_sub(self.prompt_len).max(generated)
            }
            EarlyStopping::Never => generated,
        };
        let highest_attainable = length_normalized(best_active_score, bound_len, self.length_penalty);
        self.worst_score >= highest_attainable
    }

    pub fn best(&self) -> Option<&BeamHypothesis> {
        self.hypotheses.first()
    }

    /// Hypotheses from best to worst.
    pub fn iter(&self) -> impl Iterator<Item = &BeamHypothesis> {
        self.hypotheses.iter()
    }

    pub fn into_sorted(self) -> Vec<BeamHypothesis> {
        self.hypotheses
    }
}

/// One continuation of an active beam.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Slot of the parent beam within its group.
    pub slot: usize,
    pub token: u32,
    /// Log-probability of `token` after processors and penalties.
    pub log_prob: f32,
    /// Cumulative score if selected.
    pub score: f32,
}

impl Candidate {
    pub fn expand(slot: usize, parent_score: f32, token: u32, log_prob: f32) -> Self {
        Self {
            slot,
            token,
            log_prob,
            score: parent_score + log_prob,
        }
    }
}

/// Highest score first, then lowest slot, then lowest token id.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    cmp_scores_desc(a.score, b.score)
        .then_with(|| a.slot.cmp(&b.slot))
        .then_with(|| a.token.cmp(&b.token))
}

/// Picks the best `k` candidates. Duplicate `(slot, token)` pairs, as
/// produced by repeated multinomial draws, count once.
pub fn select_top_candidates(mut candidates: Vec<Candidate>, k: usize) -> Vec<Candidate> {
    candidates.sort_by(rank);
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert((c.slot, c.token)));
    candidates.truncate(k);
    candidates
}

/// Hamming diversity: lowers each token's log-probability by `penalty`
/// times the number of times earlier groups picked it at this step.
pub fn apply_diversity_penalty(
    mut log_probs: ArrayViewMut1<'_, f32>,
    previous_group_tokens: &[u32],
    penalty: f32,
) {
    if penalty == 0.0 || previous_group_tokens.is_empty() {
        return;
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &token in previous_group_tokens {
        *counts.entry(token).or_insert(0) += 1;
    }
    let vocab = log_probs.len();
    for (token, count) in counts {
        let idx = token as usize;
        if idx < vocab {
            log_probs[idx] -= penalty * count as f32;
        }
    }
}
