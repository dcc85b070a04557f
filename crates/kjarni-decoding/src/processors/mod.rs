//! Logits processors: rules that rewrite a next-token score vector given the
//! sequence generated so far.
//!
//! Processors run in insertion order, in place, on one beam's score row. The
//! list built from a [`GenerationConfig`] always follows the same order:
//!
//! 1. forced decoder ids
//! 2. forced BOS
//! 3. forced EOS
//! 4. suppress-at-begin, then always-suppressed tokens
//! 5. model-family processors (Whisper timestamps)
//! 6. no-repeat n-gram ban, then bad words
//! 7. repetition penalty
//! 8. min-length, then min-new-tokens
//!
//! Caller-supplied processors are appended after these.

mod forced;
mod min_length;
mod ngram;
mod penalty;
mod suppress;

pub use forced::{ForceTokensLogitsProcessor, ForcedBOSLogitsProcessor, ForcedEOSLogitsProcessor};
pub use min_length::{MinLengthLogitsProcessor, MinNewTokensLengthLogitsProcessor};
pub use ngram::{NGramTable, NoRepeatNGramLogitsProcessor};
pub use penalty::RepetitionPenaltyLogitsProcessor;
pub use suppress::{
    NoBadWordsLogitsProcessor, SuppressTokensAtBeginLogitsProcessor, SuppressTokensLogitsProcessor,
};

use ndarray::ArrayViewMut1;

use crate::common::GenerationConfig;

/// One score-rewriting rule.
///
/// `input_ids` is the full token history of the row (prompt included).
/// Implementations must not keep references to either argument past the
/// call.
pub trait LogitsProcessor: Send + Sync {
    fn process(&self, input_ids: &[u32], scores: ArrayViewMut1<'_, f32>);

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

/// Sets every listed id that is inside the vocabulary to `-inf`.
pub(crate) fn ban_tokens(scores: &mut ArrayViewMut1<'_, f32>, tokens: impl IntoIterator<Item = u32>) {
    let vocab = scores.len();
    for token in tokens {
        let idx = token as usize;
        if idx < vocab {
            scores[idx] = f32::NEG_INFINITY;
        }
    }
}

/// Ordered processor pipeline.
#[derive(Default)]
pub struct LogitsProcessorList {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, processor: Box<dyn LogitsProcessor>) {
        self.processors.push(processor);
    }

    pub fn extend(&mut self, processors: impl IntoIterator<Item = Box<dyn LogitsProcessor>>) {
        self.processors.extend(processors);
    }

    /// Applies every processor in insertion order.
    pub fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        for processor in &self.processors {
            processor.process(input_ids, scores.view_mut());
        }
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}

impl IntoIterator for LogitsProcessorList {
    type Item = Box<dyn LogitsProcessor>;
    type IntoIter = std::vec::IntoIter<Box<dyn LogitsProcessor>>;

    fn into_iter(self) -> Self::IntoIter {
        self.processors.into_iter()
    }
}

impl std::fmt::Debug for LogitsProcessorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Absolute position of the first token that is not forced by
/// `forced_bos_token_id` or `forced_decoder_ids`.
pub fn begin_index(config: &GenerationConfig, prompt_len: usize) -> usize {
    let mut begin = prompt_len;
    if config.forced_bos_token_id.is_some() {
        begin += 1;
    }
    if let Some(last_forced) = config
        .forced_decoder_ids
        .as_ref()
        .and_then(|ids| ids.iter().map(|(pos, _)| *pos).max())
    {
        begin = begin.max(last_forced + 1);
    }
    begin
}

/// Builds the built-in pipeline for one generation call.
///
/// `family_processors` are the model family's extra rules and are inserted
/// after the suppression stage. Options that are unset or neutral add
/// nothing.
pub fn build_logits_processors(
    config: &GenerationConfig,
    prompt_len: usize,
    max_length: usize,
    family_processors: Vec<Box<dyn LogitsProcessor>>,
) -> LogitsProcessorList {
    let mut list = LogitsProcessorList::new();
    let eos_ids = config.eos_token_ids();

    if let Some(forced) = config.forced_decoder_ids.as_ref().filter(|ids| !ids.is_empty()) {
        list.push(Box::new(ForceTokensLogitsProcessor::new(forced.iter().copied())));
    }
    if let Some(bos) = config.forced_bos_token_id {
        list.push(Box::new(ForcedBOSLogitsProcessor::new(bos, prompt_len)));
    }
    if let Some(forced_eos) = &config.forced_eos_token_id {
        list.push(Box::new(ForcedEOSLogitsProcessor::new(max_length, forced_eos.to_vec())));
    }

    let begin = begin_index(config, prompt_len);
    if let Some(tokens) = config.begin_suppress_tokens.as_ref().filter(|t| !t.is_empty()) {
        list.push(Box::new(SuppressTokensAtBeginLogitsProcessor::new(tokens.clone(), begin)));
    }
    if let Some(tokens) = config.suppress_tokens.as_ref().filter(|t| !t.is_empty()) {
        list.push(Box::new(SuppressTokensLogitsProcessor::new(tokens.clone())));
    }

    list.extend(family_processors);

    if config.no_repeat_ngram_size > 0 {
        list.push(Box::new(NoRepeatNGramLogitsProcessor::new(config.no_repeat_ngram_size)));
    }
    if let Some(bad_words) = config.bad_words_ids.as_ref().filter(|w| !w.is_empty()) {
        list.push(Box::new(NoBadWordsLogitsProcessor::new(bad_words.clone())));
    }

    if config.repetition_penalty != 1.0 && config.repetition_penalty > 0.0 {
        list.push(Box::new(RepetitionPenaltyLogitsProcessor::new(config.repetition_penalty)));
    }

    if !eos_ids.is_empty() {
        if config.min_length > 0 {
            list.push(Box::new(MinLengthLogitsProcessor::new(config.min_length, eos_ids.clone())));
        }
        if let Some(min_new) = config.min_new_tokens.filter(|n| *n > 0) {
            list.push(Box::new(MinNewTokensLengthLogitsProcessor::new(
                prompt_len,
                min_new,
                eos_ids,
            )));
        }
    }

    log::trace!("Logits processors: {:?}", list);
    list
}
