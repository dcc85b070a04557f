use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::{Array2, Array4, s};

use super::output::{GenerateDictOutput, GenerationOutput};
use crate::beams::{
    Beam, BeamHypotheses, BeamHypothesis, BeamId, Candidate, StepAttentions,
    apply_diversity_penalty, select_top_candidates,
};
use crate::cache::CacheManager;
use crate::common::math::{cmp_scores_desc, log_softmax_1d};
use crate::common::{CancellationToken, DecodingStrategy, GenerationConfig, StepBudget, StopReason};
use crate::error::{GenerationError, GenerationResult};
use crate::processors::LogitsProcessorList;
use crate::sampling::Sampler;
use crate::traits::{StepInput, StepModel, StepOutput};

/// Beams of one diversity group of one batch element.
///
/// A group owns `group_size` places. Every finished hypothesis holds one
/// of them for the rest of the call, so at most
/// `group_size - hypotheses.len()` beams stay active.
#[derive(Debug)]
struct BeamGroup {
    element: usize,
    group_id: usize,
    active: Vec<Beam>,
    hypotheses: BeamHypotheses,
    done: bool,
}

impl BeamGroup {
    fn width(&self, group_size: usize) -> usize {
        group_size.saturating_sub(self.hypotheses.len())
    }

    fn best_active_score(&self) -> Option<f32> {
        self.active.iter().map(|beam| beam.score).reduce(f32::max)
    }

    fn num_active(&self) -> usize {
        if self.done { 0 } else { self.active.len() }
    }

    /// Completed hypotheses, or the active beams if nothing completed
    /// with a finite score.
    fn results(&self) -> Vec<BeamHypothesis> {
        if !self.hypotheses.is_empty() {
            return self.hypotheses.iter().cloned().collect();
        }
        let mut fallback: Vec<BeamHypothesis> = self
            .active
            .iter()
            .map(|beam| BeamHypothesis {
                normalized_score: beam.score,
                beam: beam.clone(),
            })
            .collect();
        fallback.sort_by(|a, b| cmp_scores_desc(a.normalized_score, b.normalized_score));
        fallback
    }
}

/// The decoding state machine of one generation call.
///
/// Every [`DecodeSession::step`] makes exactly one batched compute call for
/// all active beams, runs the processors and the sampler per beam, selects
/// survivors per group and gathers their cache rows from their parents.
/// Dropping a session discards its beams and cache without any further
/// compute.
pub struct DecodeSession {
    model: Arc<dyn StepModel>,
    config: GenerationConfig,
    processors: LogitsProcessorList,
    sampler: Sampler,
    cache: CacheManager,
    budget: StepBudget,
    groups: Vec<BeamGroup>,
    num_groups: usize,
    group_size: usize,
    returns_per_element: usize,
    prompt_len: usize,
    max_length: usize,
    cur_len: usize,
    step: usize,
    next_beam_id: u64,
    step_tokens: Vec<u32>,
    finished: bool,
}

impl DecodeSession {
    pub(crate) fn new(
        model: Arc<dyn StepModel>,
        config: GenerationConfig,
        processors: LogitsProcessorList,
        input_ids: &Array2<u32>,
        attention_mask: Option<&Array2<u32>>,
        token: CancellationToken,
    ) -> GenerationResult<Self> {
        let (batch_size, prompt_len) = input_ids.dim();
        if let Some(mask) = attention_mask {
            if mask.dim() != input_ids.dim() {
                return Err(GenerationError::config(format!(
                    "attention mask shape {:?} does not match input shape {:?}",
                    mask.dim(),
                    input_ids.dim()
                )));
            }
        }

        let max_length = config.effective_max_length(prompt_len);
        let group_size = config.group_size();
        let (num_groups, rows_per_input, returns_per_element) = match config.strategy() {
            DecodingStrategy::Greedy | DecodingStrategy::Sample => {
                (1, config.num_return_sequences.max(1), 1)
            }
            DecodingStrategy::BeamSearch { .. } | DecodingStrategy::BeamSample { .. } => {
                (1, 1, config.num_return_sequences.max(1))
            }
            DecodingStrategy::GroupBeamSearch {
                num_beam_groups, ..
            } => (num_beam_groups, 1, config.num_return_sequences.max(1)),
        };

        let mut groups = Vec::with_capacity(batch_size * rows_per_input * num_groups);
        let mut initial_ids = Vec::with_capacity(groups.capacity());
        let mut next_beam_id = 0u64;
        for batch_id in 0..batch_size {
            let prompt = input_ids.row(batch_id).to_vec();
            let mask = attention_mask
                .map(|m| m.row(batch_id).to_vec())
                .unwrap_or_else(|| vec![1; prompt_len]);
            for replica in 0..rows_per_input {
                for group_id in 0..num_groups {
                    let id = BeamId(next_beam_id);
                    next_beam_id += 1;
                    initial_ids.push(id);
                    groups.push(BeamGroup {
                        element: batch_id * rows_per_input + replica,
                        group_id,
                        active: vec![Beam::new(id, batch_id, group_id, prompt.clone(), mask.clone())],
                        hypotheses: BeamHypotheses::new(group_size, config.length_penalty, prompt_len),
                        done: false,
                    });
                }
            }
        }

        let mut cache = CacheManager::new(model.spec().cache_layout);
        cache.register(&initial_ids);

        let sampler = Sampler::from_config(&config);
        let budget = StepBudget::new(token, config.max_time);

        let finished = prompt_len >= max_length;
        if finished {
            warn!(
                "Prompt length {} already reaches max_length {}; returning the prompt",
                prompt_len, max_length
            );
        }

        debug!(
            "Starting {} decoding: batch {}, prompt {} tokens, max_length {}, {} beams in {} groups",
            sampler.name(),
            batch_size,
            prompt_len,
            max_length,
            config.num_beams,
            num_groups
        );

        Ok(Self {
            model,
            config,
            processors,
            sampler,
            cache,
            budget,
            groups,
            num_groups,
            group_size,
            returns_per_element,
            prompt_len,
            max_length,
            cur_len: prompt_len,
            step: 0,
            next_beam_id,
            step_tokens: Vec::new(),
            finished,
        })
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Absolute length cap of this call.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Current length of every active beam.
    pub fn cur_len(&self) -> usize {
        self.cur_len
    }

    /// Compute calls made so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sequences [`DecodeSession::finish`] will return.
    pub fn num_sequences(&self) -> usize {
        (self.groups.len() / self.num_groups.max(1)) * self.returns_per_element
    }

    /// Beams currently waiting for expansion.
    pub fn num_active(&self) -> usize {
        self.groups.iter().map(BeamGroup::num_active).sum()
    }

    /// Completed hypotheses held so far.
    pub fn num_finished(&self) -> usize {
        self.groups.iter().map(|g| g.hypotheses.len()).sum()
    }

    /// `(active, finished)` beams of every output row, in input order.
    /// Under beam search their sum never exceeds `num_beams`.
    pub fn element_beam_counts(&self) -> Vec<(usize, usize)> {
        self.groups
            .chunks(self.num_groups.max(1))
            .map(|element| {
                element.iter().fold((0, 0), |(active, finished), g| {
                    (active + g.num_active(), finished + g.hypotheses.len())
                })
            })
            .collect()
    }

    /// Tokens appended by the last step, in group order.
    pub fn step_tokens(&self) -> &[u32] {
        &self.step_tokens
    }

    /// Runs one decoding step. Returns `false` once decoding is over.
    ///
    /// Cancellation is checked before the compute call and fails the call
    /// with [`GenerationError::Cancelled`]. An elapsed `max_time` ends
    /// decoding as if the length cap had been reached.
    pub async fn step(&mut self) -> GenerationResult<bool> {
        self.step_tokens.clear();
        if self.finished {
            return Ok(false);
        }

        match self.budget.check() {
            Some(StopReason::Cancelled) => {
                debug!("Generation cancelled before step {}", self.step);
                self.finished = true;
                return Err(GenerationError::Cancelled);
            }
            Some(StopReason::TimeBudget) => {
                info!(
                    "max_time reached after {} steps ({:.3}s)",
                    self.step,
                    self.budget.elapsed().as_secs_f64()
                );
                self.finalize();
                return Ok(false);
            }
            None => {}
        }

        let order = self.cache.order().to_vec();
        if self.cur_len >= self.max_length || order.is_empty() {
            self.finalize();
            return Ok(false);
        }

        let locations = self.locate_beams();
        let (input_ids, attention_mask) = self.build_inputs(&order, &locations)?;

        let step = self.step;
        let output = self
            .model
            .forward_step(StepInput {
                input_ids,
                attention_mask,
                past_key_values: self.cache.state(),
                output_attentions: self.config.output_attentions,
                step,
            })
            .await
            .map_err(|source| GenerationError::Compute { step, source })?;

        let logits = output
            .next_token_scores(order.len())
            .map_err(|source| GenerationError::Compute { step, source })?;
        if self.config.output_attentions {
            self.record_attentions(&output, &order, &locations)?;
        }
        if self.config.use_cache {
            self.cache.set_batched(output.past_key_values)?;
        }

        let rows: HashMap<BeamId, usize> =
            order.iter().enumerate().map(|(row, &id)| (id, row)).collect();
        self.expand(&logits, &rows)?;
        self.cur_len += 1;
        self.step += 1;

        self.close_finished_groups()?;
        self.cache.commit()?;

        debug!(
            "Step {}: length {}, {} active beams, {:.1}ms elapsed",
            step,
            self.cur_len,
            self.num_active(),
            self.budget.elapsed().as_secs_f64() * 1000.0
        );

        if self.groups.iter().all(|g| g.done) || self.cur_len >= self.max_length {
            self.finalize();
            return Ok(false);
        }
        Ok(true)
    }

    fn locate_beams(&self) -> HashMap<BeamId, (usize, usize)> {
        let mut locations = HashMap::new();
        for (group_idx, group) in self.groups.iter().enumerate() {
            if group.done {
                continue;
            }
            for (slot, beam) in group.active.iter().enumerate() {
                locations.insert(beam.id, (group_idx, slot));
            }
        }
        locations
    }

    fn beam_at(&self, id: BeamId, locations: &HashMap<BeamId, (usize, usize)>) -> GenerationResult<&Beam> {
        let &(group, slot) = locations
            .get(&id)
            .ok_or_else(|| GenerationError::cache(format!("cache row {} has no active beam", id)))?;
        Ok(&self.groups[group].active[slot])
    }

    /// Full sequences on the first step or without a cache, the newest
    /// token otherwise.
    fn build_inputs(
        &self,
        order: &[BeamId],
        locations: &HashMap<BeamId, (usize, usize)>,
    ) -> GenerationResult<(Array2<u32>, Array2<u32>)> {
        let beams = order
            .iter()
            .map(|&id| self.beam_at(id, locations))
            .collect::<GenerationResult<Vec<&Beam>>>()?;

        let full = self.step == 0 || !self.config.use_cache;
        let input_len = if full { self.cur_len } else { 1 };
        let offset = self.cur_len - input_len;

        let input_ids =
            Array2::from_shape_fn((beams.len(), input_len), |(r, c)| beams[r].sequence[offset + c]);
        let attention_mask =
            Array2::from_shape_fn((beams.len(), self.cur_len), |(r, c)| beams[r].attention_mask[c]);
        Ok((input_ids, attention_mask))
    }

    fn record_attentions(
        &mut self,
        output: &StepOutput,
        order: &[BeamId],
        locations: &HashMap<BeamId, (usize, usize)>,
    ) -> GenerationResult<()> {
        let first_step = self.step == 0;
        for (cross, layers) in [
            (false, output.decoder_attentions.as_deref()),
            (true, output.cross_attentions.as_deref()),
        ] {
            let Some(layers) = layers else { continue };
            if let Some(bad) = layers.iter().find(|l| l.shape()[0] != order.len()) {
                return Err(GenerationError::Compute {
                    step: self.step,
                    source: anyhow::anyhow!(
                        "attention tensor {:?} does not cover {} beams",
                        bad.shape(),
                        order.len()
                    ),
                });
            }
            for (row, id) in order.iter().enumerate() {
                let Some(&(group, slot)) = locations.get(id) else { continue };
                let attentions = beam_step_attentions(layers, row, first_step);
                let beam = &mut self.groups[group].active[slot];
                if cross {
                    beam.cross_attentions.push(attentions);
                } else {
                    beam.decoder_attentions.push(attentions);
                }
            }
        }
        Ok(())
    }

    /// Scores every continuation of every active beam and keeps the best
    /// ones that fit in each group's free places. Selected eos children
    /// become hypotheses, the rest stay active and fork their parent's
    /// cache.
    fn expand(&mut self, logits: &Array2<f32>, rows: &HashMap<BeamId, usize>) -> GenerationResult<()> {
        let penalty = self.config.diversity_penalty;
        let group_size = self.group_size;

        for element in self.groups.chunks_mut(self.num_groups) {
            // tokens picked by earlier groups of this element at this step
            let mut chosen: Vec<u32> = Vec::new();

            for group in element.iter_mut() {
                if group.done {
                    continue;
                }

                let mut candidates = Vec::new();
                for (slot, beam) in group.active.iter().enumerate() {
                    let row = *rows.get(&beam.id).ok_or_else(|| {
                        GenerationError::cache(format!("no logits row for beam {}", beam.id))
                    })?;

                    let mut scores = logits.row(row).to_owned();
                    self.processors.process(&beam.sequence, scores.view_mut());
                    let mut log_probs = log_softmax_1d(scores.view());
                    if group.group_id > 0 {
                        apply_diversity_penalty(log_probs.view_mut(), &chosen, penalty);
                    }
                    for (token, log_prob) in self.sampler.sample(log_probs.view()) {
                        candidates.push(Candidate::expand(slot, beam.score, token, log_prob));
                    }
                }

                let selected = select_top_candidates(candidates, group.width(group_size));
                let mut active = Vec::with_capacity(selected.len());
                for candidate in selected {
                    let parent = &group.active[candidate.slot];
                    let token = candidate.token;
                    let parent_id = parent.id;
                    let mut child = parent.extend(
                        BeamId(self.next_beam_id),
                        token,
                        candidate.log_prob,
                        candidate.score,
                    );
                    self.next_beam_id += 1;
                    chosen.push(token);
                    self.step_tokens.push(token);

                    if self.config.is_eos(token) {
                        child.is_done = true;
                        group.hypotheses.add(child);
                    } else {
                        self.cache.fork(parent_id, child.id)?;
                        active.push(child);
                    }
                }
                group.active = active;
            }
        }
        Ok(())
    }

    /// Marks groups that can no longer improve as done and drops their
    /// active beams' cache rows.
    fn close_finished_groups(&mut self) -> GenerationResult<()> {
        let early_stopping = self.config.early_stopping;
        for group in self.groups.iter_mut().filter(|g| !g.done) {
            let finished = match group.best_active_score() {
                None => true,
                Some(best) => {
                    group
                        .hypotheses
                        .is_done(early_stopping, best, self.cur_len, self.max_length)
                }
            };
            if !finished {
                continue;
            }

            group.done = true;
            for beam in &group.active {
                self.cache.release(beam.id)?;
            }
            debug!(
                "Group {} of element {} finished at length {} with {} hypotheses",
                group.group_id,
                group.element,
                self.cur_len,
                group.hypotheses.len()
            );
        }
        Ok(())
    }

    /// Moves every still-active beam into its group's results.
    fn finalize(&mut self) {
        if self.finished && self.groups.iter().all(|g| g.done) {
            return;
        }
        for group in self.groups.iter_mut().filter(|g| !g.done) {
            for beam in group.active.clone() {
                group.hypotheses.add(beam);
            }
            group.done = true;
        }
        self.finished = true;
    }

    /// Ranks the results of each batch element and builds the output.
    pub fn finish(mut self) -> GenerationOutput {
        self.finalize();

        let mut selected: Vec<BeamHypothesis> = Vec::new();
        for element in self.groups.chunks(self.num_groups) {
            let mut pool: Vec<BeamHypothesis> = element.iter().flat_map(BeamGroup::results).collect();
            pool.sort_by(|a, b| cmp_scores_desc(a.normalized_score, b.normalized_score));
            if pool.len() < self.returns_per_element {
                warn!(
                    "Only {} hypotheses for element {}, {} requested",
                    pool.len(),
                    element.first().map(|g| g.element).unwrap_or_default(),
                    self.returns_per_element
                );
            }
            selected.extend(pool.into_iter().take(self.returns_per_element));
        }

        let generated: usize = selected
            .iter()
            .map(|h| h.beam.sequence.len().saturating_sub(self.prompt_len))
            .sum();
        let elapsed = self.budget.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            info!(
                "Generation complete: {} steps, {} sequences, {} tokens in {:.3}s ({:.2} tokens/s)",
                self.step,
                selected.len(),
                generated,
                elapsed,
                generated as f64 / elapsed
            );
        } else {
            info!(
                "Generation complete: {} steps, {} sequences, {} tokens",
                self.step,
                selected.len(),
                generated
            );
        }

        if !self.config.return_dict_in_generate {
            return GenerationOutput::Sequences(
                selected.into_iter().map(|h| h.beam.sequence).collect(),
            );
        }

        let output_scores = self.config.output_scores;
        let output_attentions = self.config.output_attentions;
        let mut dict = GenerateDictOutput {
            prompt_len: self.prompt_len,
            scores: output_scores.then(Vec::new),
            decoder_attentions: output_attentions.then(Vec::new),
            cross_attentions: output_attentions.then(Vec::new),
            ..Default::default()
        };
        for hypothesis in selected {
            let beam = hypothesis.beam;
            dict.sequences_scores.push(hypothesis.normalized_score);
            if let Some(scores) = dict.scores.as_mut() {
                scores.push(beam.token_scores);
            }
            if let Some(attentions) = dict.decoder_attentions.as_mut() {
                attentions.push(beam.decoder_attentions);
            }
            if let Some(attentions) = dict.cross_attentions.as_mut() {
                attentions.push(beam.cross_attentions);
            }
            dict.sequences.push(beam.sequence);
        }
        GenerationOutput::Dict(dict)
    }
}

/// One beam's slice of a step's per-layer attentions. The first step keeps
/// every query position, later steps only the newest.
fn beam_step_attentions(layers: &[Array4<f32>], row: usize, first_step: bool) -> StepAttentions {
    Arc::new(
        layers
            .iter()
            .map(|layer| {
                let queries = layer.shape()[2];
                let start = if first_step { 0 } else { queries.saturating_sub(1) };
                layer.slice(s![row..row + 1, .., start.., ..]).to_owned()
            })
            .collect(),
    )
}
