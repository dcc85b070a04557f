//! Samplers turn one processed score row into candidate `(token, score)`
//! pairs.
//!
//! Every sampler receives log-probabilities and reports the chosen tokens'
//! input values as their scores, so the beam engine can add them to a
//! running log-probability sum.

use ndarray::ArrayView1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::math::{argmax, cmp_desc_then_index, top_k};
use crate::common::{DecodingStrategy, GenerationConfig};

/// Picks an index from a probability vector.
///
/// Walks the cumulative distribution and returns the first index whose
/// cumulative mass exceeds `draw` (a uniform value in `[0, 1)`). Rounding
/// shortfalls fall back to the last index with non-zero mass.
pub fn random_select(probs: &[f32], draw: f32) -> usize {
    let mut cumulative = 0.0f32;
    let mut last_nonzero = 0;
    for (idx, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        last_nonzero = idx;
        if cumulative > draw {
            return idx;
        }
    }
    last_nonzero
}

/// The warper knobs applied before a multinomial draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub typical_p: f32,
    pub epsilon_cutoff: f32,
    pub eta_cutoff: f32,
}

impl SamplingParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            typical_p: config.typical_p,
            epsilon_cutoff: config.epsilon_cutoff,
            eta_cutoff: config.eta_cutoff,
        }
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

fn in_open_unit(x: f32) -> bool {
    x > 0.0 && x < 1.0
}

/// Candidate list sorted by probability, highest first.
type Candidates = Vec<(usize, f32)>;

fn renormalize(candidates: &mut Candidates) {
    let total: f32 = candidates.iter().map(|&(_, p)| p).sum();
    if total > 0.0 && total.is_finite() {
        for (_, p) in candidates.iter_mut() {
            *p /= total;
        }
    } else {
        let uniform = 1.0 / candidates.len().max(1) as f32;
        for (_, p) in candidates.iter_mut() {
            *p = uniform;
        }
    }
}

/// Keeps the smallest prefix whose mass reaches `top_p`.
fn nucleus_filter(candidates: &mut Candidates, top_p: f32) {
    let mut cumulative = 0.0f32;
    let mut keep = candidates.len();
    for (i, &(_, p)) in candidates.iter().enumerate() {
        cumulative += p;
        if cumulative >= top_p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

/// Keeps the tokens whose surprisal is closest to the entropy until
/// `typical_p` mass is covered.
fn typical_filter(candidates: &mut Candidates, typical_p: f32) {
    let entropy: f32 = candidates
        .iter()
        .filter(|&&(_, p)| p > 0.0)
        .map(|&(_, p)| -p * p.ln())
        .sum();

    let mut by_typicality: Vec<(usize, f32, f32)> = candidates
        .iter()
        .enumerate()
        .map(|(pos, &(_, p))| {
            let deviation = if p > 0.0 { (p.ln() + entropy).abs() } else { f32::INFINITY };
            (pos, p, deviation)
        })
        .collect();
    by_typicality.sort_by(|a, b| {
        a.2.total_cmp(&b.2).then_with(|| a.0.cmp(&b.0))
    });

    let mut keep = vec![false; candidates.len()];
    let mut cumulative = 0.0f32;
    for &(pos, p, _) in &by_typicality {
        keep[pos] = true;
        cumulative += p;
        if cumulative >= typical_p {
            break;
        }
    }

    let mut pos = 0;
    candidates.retain(|_| {
        let kept = keep[pos];
        pos += 1;
        kept
    });
}

/// Drops candidates below `threshold`, always keeping the most probable.
fn cutoff_filter(candidates: &mut Candidates, threshold: f32) {
    let mut first = true;
    candidates.retain(|&(_, p)| {
        let kept = first || p >= threshold;
        first = false;
        kept
    });
}

/// Multinomial sampling after temperature, top-k, top-p, typical, epsilon
/// and eta warping, in that order.
#[derive(Debug, Clone)]
pub struct MultinomialSampler {
    params: SamplingParams,
    num_samples: usize,
    rng: StdRng,
}

impl MultinomialSampler {
    /// `seed = None` seeds from OS entropy.
    pub fn new(params: SamplingParams, num_samples: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            params,
            num_samples: num_samples.max(1),
            rng,
        }
    }

    /// The renormalized distribution a draw is taken from.
    ///
    /// Never empty for a non-empty row: when every filter would remove
    /// everything, the highest scoring token is kept.
    pub fn distribution(&self, scores: ArrayView1<'_, f32>) -> Vec<(usize, f32)> {
        let p = &self.params;
        let temperature = if p.temperature > 0.0 && p.temperature.is_finite() {
            p.temperature
        } else {
            1.0
        };

        let mut scaled: Vec<(usize, f32)> = scores
            .iter()
            .enumerate()
            .map(|(i, &s)| (i, s / temperature))
            .collect();
        if scaled.is_empty() {
            return Vec::new();
        }
        scaled.sort_by(|&a, &b| cmp_desc_then_index(a, b));

        let finite = scaled.iter().take_while(|(_, s)| *s > f32::NEG_INFINITY).count();
        scaled.truncate(finite.max(1));
        if p.top_k > 0 {
            scaled.truncate(p.top_k);
        }

        let max_score = scaled[0].1;
        let mut candidates: Candidates = if max_score == f32::NEG_INFINITY {
            scaled.into_iter().map(|(i, _)| (i, 1.0)).collect()
        } else {
            scaled
                .into_iter()
                .map(|(i, s)| (i, (s - max_score).exp()))
                .collect()
        };
        renormalize(&mut candidates);

        if in_open_unit(p.top_p) {
            nucleus_filter(&mut candidates, p.top_p);
            renormalize(&mut candidates);
        }
        if in_open_unit(p.typical_p) {
            typical_filter(&mut candidates, p.typical_p);
            renormalize(&mut candidates);
        }
        if in_open_unit(p.epsilon_cutoff) {
            cutoff_filter(&mut candidates, p.epsilon_cutoff);
            renormalize(&mut candidates);
        }
        if in_open_unit(p.eta_cutoff) {
            let entropy: f32 = candidates
                .iter()
                .filter(|&&(_, q)| q > 0.0)
                .map(|&(_, q)| -q * q.ln())
                .sum();
            let eta = p.eta_cutoff.min(p.eta_cutoff.sqrt() * (-entropy).exp());
            cutoff_filter(&mut candidates, eta);
            renormalize(&mut candidates);
        }

        candidates
    }

    pub fn sample(&mut self, scores: ArrayView1<'_, f32>) -> Vec<(u32, f32)> {
        let candidates = self.distribution(scores);
        if candidates.is_empty() {
            return Vec::new();
        }
        let probs: Vec<f32> = candidates.iter().map(|&(_, p)| p).collect();

        (0..self.num_samples)
            .map(|_| {
                let draw: f32 = self.rng.r#gen();
                let (token, _) = candidates[random_select(&probs, draw)];
                (token as u32, scores[token])
            })
            .collect()
    }
}

/// Deterministic top-`num_candidates` selection used by beam search.
#[derive(Debug, Clone, Copy)]
pub struct BeamSearchSampler {
    num_candidates: usize,
}

impl BeamSearchSampler {
    pub fn new(num_candidates: usize) -> Self {
        Self {
            num_candidates: num_candidates.max(1),
        }
    }

    pub fn sample(&self, scores: ArrayView1<'_, f32>) -> Vec<(u32, f32)> {
        top_k(scores, self.num_candidates)
            .into_iter()
            .map(|(i, s)| (i as u32, s))
            .collect()
    }
}

/// Strategy-specific sampler, chosen once per generation call.
#[derive(Debug, Clone)]
pub enum Sampler {
    Greedy,
    Multinomial(MultinomialSampler),
    BeamSearch(BeamSearchSampler),
}

impl Sampler {
    /// Greedy for `do_sample = false, num_beams = 1`, multinomial whenever
    /// sampling, top-`2 * group_size` candidates for beam search.
    pub fn from_config(config: &GenerationConfig) -> Self {
        let params = SamplingParams::from_config(config);
        match config.strategy() {
            DecodingStrategy::Greedy => Sampler::Greedy,
            DecodingStrategy::Sample => {
                Sampler::Multinomial(MultinomialSampler::new(params, 1, config.seed))
            }
            DecodingStrategy::BeamSample { .. } => Sampler::Multinomial(MultinomialSampler::new(
                params,
                2 * config.group_size(),
                config.seed,
            )),
            DecodingStrategy::BeamSearch { .. } | DecodingStrategy::GroupBeamSearch { .. } => {
                Sampler::BeamSearch(BeamSearchSampler::new(2 * config.group_size()))
            }
        }
    }

    /// Candidates for one beam. Never empty for a non-empty row.
    pub fn sample(&mut self, log_probs: ArrayView1<'_, f32>) -> Vec<(u32, f32)> {
        if log_probs.is_empty() {
            return Vec::new();
        }
        match self {
            Sampler::Greedy => {
                let best = argmax(log_probs);
                vec![(best as u32, log_probs[best])]
            }
            Sampler::Multinomial(sampler) => sampler.sample(log_probs),
            Sampler::BeamSearch(sampler) => sampler.sample(log_probs),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Sampler::Greedy => "greedy",
            Sampler::Multinomial(_) => "multinomial",
            Sampler::BeamSearch(_) => "beam_search",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::math::log_softmax_1d;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn params() -> SamplingParams {
        SamplingParams {
            top_k: 0,
            ..SamplingParams::default()
        }
    }

    // ========================================================================
    //  random_select
    // ========================================================================

    #[test]
    fn test_random_select_walks_cdf() {
        let probs = [0.2, 0.5, 0.3];
        assert_eq!(random_select(&probs, 0.0), 0);
        assert_eq!(random_select(&probs, 0.19), 0);
        assert_eq!(random_select(&probs, 0.2), 1);
        assert_eq!(random_select(&probs, 0.69), 1);
        assert_eq!(random_select(&probs, 0.71), 2);
        assert_eq!(random_select(&probs, 0.9999), 2);
    }

    #[test]
    fn test_random_select_skips_zero_mass() {
        let probs = [0.0, 0.0, 1.0, 0.0];
        assert_eq!(random_select(&probs, 0.0), 2);
        assert_eq!(random_select(&probs, 0.99), 2);
    }

    #[test]
    fn test_random_select_rounding_fallback() {
        let probs = [0.3, 0.3, 0.3];
        assert_eq!(random_select(&probs, 0.95), 2);
    }

    // ========================================================================
    //  Greedy / beam
    // ========================================================================

    #[test]
    fn test_greedy_picks_argmax() {
        let mut sampler = Sampler::Greedy;
        let lp = log_softmax_1d(array![0.1f32, 3.0, 0.2].view());
        let picked = sampler.sample(lp.view());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].0, 1);
        assert_abs_diff_eq!(picked[0].1, lp[1]);
    }

    #[test]
    fn test_beam_sampler_top_candidates() {
        let sampler = BeamSearchSampler::new(2);
        let picked = sampler.sample(array![-3.0f32, -0.5, -0.5, -1.0].view());
        assert_eq!(picked, vec![(1, -0.5), (2, -0.5)]);
    }

    #[test]
    fn test_from_config_selects_strategy() {
        let mut config = GenerationConfig::default();
        assert_eq!(Sampler::from_config(&config).name(), "greedy");

        config.num_beams = 3;
        match Sampler::from_config(&config) {
            Sampler::BeamSearch(s) => assert_eq!(s.num_candidates, 6),
            other => panic!("expected beam sampler, got {}", other.name()),
        }

        config.do_sample = true;
        assert_eq!(Sampler::from_config(&config).name(), "multinomial");
    }

    // ========================================================================
    //  Multinomial
    // ========================================================================

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let scores = log_softmax_1d(array![1.0f32, 1.2, 0.8, 1.1, 0.9].view());
        let mut a = MultinomialSampler::new(params(), 1, Some(42));
        let mut b = MultinomialSampler::new(params(), 1, Some(42));

        let draws_a: Vec<_> = (0..50).map(|_| a.sample(scores.view())[0].0).collect();
        let draws_b: Vec<_> = (0..50).map(|_| b.sample(scores.view())[0].0).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn test_top_k_restricts_support() {
        let sampler = MultinomialSampler::new(
            SamplingParams {
                top_k: 2,
                ..params()
            },
            1,
            Some(0),
        );
        let dist = sampler.distribution(array![0.1f32, 5.0, 4.0, 0.2].view());
        let tokens: Vec<usize> = dist.iter().map(|(i, _)| *i).collect();
        assert_eq!(tokens, vec![1, 2]);
        assert_abs_diff_eq!(dist.iter().map(|(_, p)| p).sum::<f32>(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_top_p_keeps_smallest_nucleus() {
        let probs = Array1::from_vec(vec![0.5f32, 0.3, 0.15, 0.05]);
        let scores = probs.mapv(f32::ln);
        let sampler = MultinomialSampler::new(
            SamplingParams {
                top_p: 0.75,
                ..params()
            },
            1,
            Some(0),
        );
        let dist = sampler.distribution(scores.view());
        assert_eq!(dist.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_tiny_top_p_falls_back_to_best() {
        let sampler = MultinomialSampler::new(
            SamplingParams {
                top_p: 1e-9,
                ..params()
            },
            1,
            Some(0),
        );
        let dist = sampler.distribution(array![0.0f32, 2.0, 1.0].view());
        assert_eq!(dist.len(), 1);
        assert_eq!(dist[0].0, 1);
        assert_abs_diff_eq!(dist[0].1, 1.0);
    }

    #[test]
    fn test_out_of_range_knobs_are_noops() {
        let base = MultinomialSampler::new(params(), 1, Some(0));
        let odd = MultinomialSampler::new(
            SamplingParams {
                top_p: 1.7,
                typical_p: -2.0,
                epsilon_cutoff: 3.0,
                temperature: -1.0,
                ..params()
            },
            1,
            Some(0),
        );
        let scores = array![0.3f32, 0.1, 0.9];
        assert_eq!(base.distribution(scores.view()), odd.distribution(scores.view()));
    }

    #[test]
    fn test_temperature_sharpens() {
        let scores = array![1.0f32, 2.0];
        let hot = MultinomialSampler::new(SamplingParams { temperature: 2.0, ..params() }, 1, Some(0));
        let cold = MultinomialSampler::new(SamplingParams { temperature: 0.5, ..params() }, 1, Some(0));
        let p_hot = hot.distribution(scores.view())[0].1;
        let p_cold = cold.distribution(scores.view())[0].1;
        assert!(p_cold > p_hot);
    }

    #[test]
    fn test_epsilon_cutoff_keeps_at_least_one() {
        let sampler = MultinomialSampler::new(
            SamplingParams {
                epsilon_cutoff: 0.9,
                ..params()
            },
            1,
            Some(0),
        );
        let dist = sampler.distribution(array![0.0f32, 0.0, 0.0].view());
        assert_eq!(dist, vec![(0, 1.0)]);
    }

    #[test]
    fn test_typical_filter_keeps_mass() {
        let probs = Array1::from_vec(vec![0.4f32, 0.3, 0.2, 0.1]);
        let sampler = MultinomialSampler::new(
            SamplingParams {
                typical_p: 0.5,
                ..params()
            },
            1,
            Some(0),
        );
        let dist = sampler.distribution(probs.mapv(f32::ln).view());
        assert!(!dist.is_empty() && dist.len() < 4);
        assert_abs_diff_eq!(dist.iter().map(|(_, p)| p).sum::<f32>(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_eta_cutoff_drops_tail() {
        let probs = Array1::from_vec(vec![0.9f32, 0.09, 0.01]);
        let sampler = MultinomialSampler::new(
            SamplingParams {
                eta_cutoff: 0.05,
                ..params()
            },
            1,
            Some(0),
        );
        let dist = sampler.distribution(probs.mapv(f32::ln).view());
        assert!(dist.iter().all(|(i, _)| *i != 2));
    }

    #[test]
    fn test_banned_tokens_never_sampled() {
        let scores = array![f32::NEG_INFINITY, -0.1, f32::NEG_INFINITY, -2.5];
        let mut sampler = MultinomialSampler::new(params(), 8, Some(7));
        for (token, score) in sampler.sample(scores.view()) {
            assert!(token == 1 || token == 3);
            assert!(score.is_finite());
        }
    }

    #[test]
    fn test_fully_banned_row_still_progresses() {
        let scores = Array1::from_elem(4, f32::NEG_INFINITY);
        let mut sampler = Sampler::Multinomial(MultinomialSampler::new(params(), 1, Some(1)));
        assert_eq!(sampler.sample(scores.view()).len(), 1);
        assert_eq!(Sampler::Greedy.sample(scores.view())[0].0, 0);
    }
}
