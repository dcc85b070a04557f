//! Fully resolved generation configuration.
//!
//! This is what the decoding loop consumes. It is immutable once created.

use crate::common::{DecodingStrategy, GenerationConfig};
use crate::error::{GenerationError, GenerationResult};

#[derive(Debug, Clone)]
pub struct ResolvedGenerationConfig {
    pub(crate) inner: GenerationConfig,
}

impl ResolvedGenerationConfig {
    pub fn new(config: GenerationConfig) -> Self {
        Self { inner: config }
    }

    pub fn into_inner(self) -> GenerationConfig {
        self.inner
    }

    pub fn as_ref(&self) -> &GenerationConfig {
        &self.inner
    }

    pub fn strategy(&self) -> DecodingStrategy {
        self.inner.strategy()
    }

    pub fn is_beam_search(&self) -> bool {
        self.inner.num_beams > 1
    }

    /// Rejects contradictory combinations before any step runs.
    ///
    /// Out-of-range numeric knobs such as `top_p = 3.0` are not rejected;
    /// the sampler ignores them.
    pub fn validate(&self) -> GenerationResult<()> {
        let c = &self.inner;

        if c.num_beams == 0 {
            return Err(GenerationError::config("num_beams must be at least 1"));
        }
        if c.num_beam_groups == 0 {
            return Err(GenerationError::config("num_beam_groups must be at least 1"));
        }
        if c.num_beam_groups > c.num_beams {
            return Err(GenerationError::config(format!(
                "num_beam_groups ({}) cannot exceed num_beams ({})",
                c.num_beam_groups, c.num_beams
            )));
        }
        if c.num_beams % c.num_beam_groups != 0 {
            return Err(GenerationError::config(format!(
                "num_beams ({}) must be divisible by num_beam_groups ({})",
                c.num_beams, c.num_beam_groups
            )));
        }
        if c.do_sample && c.num_beam_groups > 1 {
            return Err(GenerationError::config(
                "diverse beam search (num_beam_groups > 1) cannot be combined with do_sample",
            ));
        }
        if c.num_return_sequences == 0 {
            return Err(GenerationError::config("num_return_sequences must be at least 1"));
        }
        match c.strategy() {
            DecodingStrategy::Greedy if c.num_return_sequences > 1 => {
                return Err(GenerationError::config(
                    "greedy decoding cannot return more than one sequence; \
                     enable do_sample or beam search",
                ));
            }
            DecodingStrategy::BeamSearch { num_beams }
            | DecodingStrategy::BeamSample { num_beams }
            | DecodingStrategy::GroupBeamSearch { num_beams, .. }
                if c.num_return_sequences > num_beams =>
            {
                return Err(GenerationError::config(format!(
                    "num_return_sequences ({}) cannot exceed num_beams ({})",
                    c.num_return_sequences, num_beams
                )));
            }
            _ => {}
        }
        if c.max_length == 0 && c.max_new_tokens.is_none() {
            return Err(GenerationError::config(
                "no length limit: set max_length or max_new_tokens",
            ));
        }
        if c.return_timestamps && c.no_timestamps_token_id.is_none() {
            return Err(GenerationError::config(
                "return_timestamps requires no_timestamps_token_id",
            ));
        }
        if c.return_token_timestamps
            && c.alignment_heads.as_ref().is_none_or(|heads| heads.is_empty())
        {
            return Err(GenerationError::config(
                "return_token_timestamps requires alignment_heads",
            ));
        }

        if c.diversity_penalty > 0.0 && c.num_beam_groups == 1 {
            log::warn!("diversity_penalty has no effect with a single beam group");
        }
        if c.do_sample && c.temperature <= 0.0 {
            log::warn!(
                "temperature {} is not positive; sampling without temperature scaling",
                c.temperature
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(f: impl FnOnce(&mut GenerationConfig)) -> ResolvedGenerationConfig {
        let mut config = GenerationConfig::default();
        f(&mut config);
        ResolvedGenerationConfig::new(config)
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(resolved(|_| {}).validate().is_ok());
    }

    #[test]
    fn test_zero_beams_rejected() {
        let err = resolved(|c| c.num_beams = 0).validate().unwrap_err();
        assert!(matches!(err, GenerationError::Configuration(_)));
    }

    #[test]
    fn test_groups_must_divide_beams() {
        assert!(resolved(|c| {
            c.num_beams = 4;
            c.num_beam_groups = 3;
        })
        .validate()
        .is_err());

        assert!(resolved(|c| {
            c.num_beams = 2;
            c.num_beam_groups = 4;
        })
        .validate()
        .is_err());

        assert!(resolved(|c| {
            c.num_beams = 4;
            c.num_beam_groups = 2;
            c.diversity_penalty = 0.5;
        })
        .validate()
        .is_ok());
    }

    #[test]
    fn test_sampling_with_groups_rejected() {
        assert!(resolved(|c| {
            c.num_beams = 4;
            c.num_beam_groups = 2;
            c.do_sample = true;
        })
        .validate()
        .is_err());
    }

    #[test]
    fn test_return_sequences_bounds() {
        assert!(resolved(|c| c.num_return_sequences = 2).validate().is_err());
        assert!(resolved(|c| {
            c.num_beams = 2;
            c.num_return_sequences = 3;
        })
        .validate()
        .is_err());
        assert!(resolved(|c| {
            c.do_sample = true;
            c.num_return_sequences = 3;
        })
        .validate()
        .is_ok());
    }

    #[test]
    fn test_missing_length_limit_rejected() {
        assert!(resolved(|c| c.max_length = 0).validate().is_err());
        assert!(resolved(|c| {
            c.max_length = 0;
            c.max_new_tokens = Some(4);
        })
        .validate()
        .is_ok());
    }

    #[test]
    fn test_out_of_range_knobs_tolerated() {
        assert!(resolved(|c| {
            c.do_sample = true;
            c.top_p = 3.0;
            c.temperature = -1.0;
            c.typical_p = 0.0;
        })
        .validate()
        .is_ok());
    }

    #[test]
    fn test_timestamp_requirements() {
        assert!(resolved(|c| c.return_timestamps = true).validate().is_err());
        assert!(resolved(|c| {
            c.return_timestamps = true;
            c.no_timestamps_token_id = Some(50363);
        })
        .validate()
        .is_ok());
        assert!(resolved(|c| c.return_token_timestamps = true).validate().is_err());
        assert!(resolved(|c| {
            c.return_token_timestamps = true;
            c.alignment_heads = Some(vec![(0, 0)]);
        })
        .validate()
        .is_ok());
    }
}
