use ndarray::{ArrayViewMut1, s};

use crate::common::math::{log_softmax_1d, log_sum_exp};
use crate::processors::{LogitsProcessor, ban_tokens};

/// Enforces Whisper's timestamp grammar.
///
/// Timestamps come in pairs around text, never decrease, and the first
/// generated token is a timestamp no later than
/// `max_initial_timestamp_index`. When the timestamps together are more
/// likely than any single text token, a timestamp is forced.
#[derive(Debug, Clone)]
pub struct WhisperTimeStampLogitsProcessor {
    eos_token_id: u32,
    no_timestamps_token_id: u32,
    timestamp_begin: u32,
    begin_index: usize,
    max_initial_timestamp_index: Option<usize>,
}

impl WhisperTimeStampLogitsProcessor {
    /// Timestamp tokens start right after `no_timestamps_token_id`.
    /// `begin_index` is the position of the first free token.
    pub fn new(
        eos_token_id: u32,
        no_timestamps_token_id: u32,
        begin_index: usize,
        max_initial_timestamp_index: Option<usize>,
    ) -> Self {
        Self {
            eos_token_id,
            no_timestamps_token_id,
            timestamp_begin: no_timestamps_token_id + 1,
            begin_index,
            max_initial_timestamp_index,
        }
    }

    pub fn timestamp_begin(&self) -> u32 {
        self.timestamp_begin
    }

    fn is_timestamp(&self, token: u32) -> bool {
        token >= self.timestamp_begin
    }
}

fn ban_range(scores: &mut ArrayViewMut1<'_, f32>, start: usize, end: usize) {
    let end = end.min(scores.len());
    if start < end {
        scores.slice_mut(s![start..end]).fill(f32::NEG_INFINITY);
    }
}

impl LogitsProcessor for WhisperTimeStampLogitsProcessor {
    fn process(&self, input_ids: &[u32], mut scores: ArrayViewMut1<'_, f32>) {
        let vocab = scores.len();
        let ts_begin = (self.timestamp_begin as usize).min(vocab);
        ban_tokens(&mut scores, [self.no_timestamps_token_id]);

        let sampled = input_ids.get(self.begin_index..).unwrap_or(&[]);
        let last_was_timestamp = sampled.last().is_some_and(|&t| self.is_timestamp(t));
        let penultimate_was_timestamp =
            sampled.len() < 2 || self.is_timestamp(sampled[sampled.len() - 2]);

        if last_was_timestamp {
            if penultimate_was_timestamp {
                // a closed pair or the opening timestamp: text must follow
                ban_range(&mut scores, ts_begin, vocab);
            } else {
                // text just ended: close with a timestamp or stop
                ban_range(&mut scores, 0, self.eos_token_id as usize);
            }
        }

        if let Some(&last_timestamp) = sampled.iter().rev().find(|&&t| self.is_timestamp(t)) {
            let first_allowed = if last_was_timestamp && !penultimate_was_timestamp {
                last_timestamp
            } else {
                last_timestamp + 1
            };
            ban_range(&mut scores, ts_begin, first_allowed as usize);
        }

        if input_ids.len() == self.begin_index {
            ban_range(&mut scores, 0, ts_begin);
            if let Some(max_initial) = self.max_initial_timestamp_index {
                let last_allowed = self.timestamp_begin as usize + max_initial;
                ban_range(&mut scores, last_allowed + 1, vocab);
            }
        }

        if ts_begin == 0 || ts_begin >= vocab {
            return;
        }
        let log_probs = log_softmax_1d(scores.view());
        let timestamp_log_prob = log_sum_exp(log_probs.slice(s![ts_begin..]));
        let max_text_log_prob = log_probs
            .slice(s![..ts_begin])
            .fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        if timestamp_log_prob > max_text_log_prob {
            ban_range(&mut scores, 0, ts_begin);
        }
    }

    fn name(&self) -> &'static str {
        "whisper_timestamps"
    }
}

/// Text between two timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampSegment {
    /// Seconds.
    pub start: f32,
    /// Seconds. `None` when the text runs to the end without a closing
    /// timestamp.
    pub end: Option<f32>,
    pub tokens: Vec<u32>,
}

/// Splits generated tokens into timed segments.
///
/// A timestamp opens a segment, the next timestamp closes it and opens
/// the following one. Tokens at or above `first_special_token` that are
/// not timestamps are skipped. Segments without text are dropped.
pub fn parse_timestamp_segments(
    tokens: &[u32],
    timestamp_begin: u32,
    first_special_token: u32,
    time_precision: f32,
) -> Vec<TimestampSegment> {
    let mut segments = Vec::new();
    let mut start: Option<f32> = None;
    let mut text: Vec<u32> = Vec::new();

    for &token in tokens {
        if token >= timestamp_begin {
            let time = (token - timestamp_begin) as f32 * time_precision;
            if let Some(opened) = start {
                if !text.is_empty() {
                    segments.push(TimestampSegment {
                        start: opened,
                        end: Some(time),
                        tokens: std::mem::take(&mut text),
                    });
                }
            }
            start = Some(time);
        } else if token < first_special_token {
            text.push(token);
        }
    }

    if let Some(opened) = start {
        if !text.is_empty() {
            segments.push(TimestampSegment {
                start: opened,
                end: None,
                tokens: text,
            });
        }
    }

    segments
}
