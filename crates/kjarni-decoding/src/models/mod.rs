//! Model families and the registry that maps `model_type` strings to them.
//!
//! A family contributes the decoding rules that only make sense for its
//! models, such as Whisper's timestamp grammar. Everything else about a
//! model stays behind [`crate::traits::StepModel`].

pub mod registry;
pub mod whisper;

pub use registry::ModelRegistry;

use crate::common::GenerationConfig;
use crate::processors::LogitsProcessor;

/// Family-specific hooks into the decoding pipeline.
pub trait ModelFamily: Send + Sync {
    /// Registry key of the family.
    fn name(&self) -> &'static str;

    /// Processors inserted after the suppression stage of the built-in
    /// pipeline. `begin_index` is the first position not forced by the
    /// config.
    fn logits_processors(
        &self,
        config: &GenerationConfig,
        begin_index: usize,
    ) -> Vec<Box<dyn LogitsProcessor>>;
}

/// Decoder-only and encoder-decoder text models. Adds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericFamily;

impl ModelFamily for GenericFamily {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn logits_processors(
        &self,
        _config: &GenerationConfig,
        _begin_index: usize,
    ) -> Vec<Box<dyn LogitsProcessor>> {
        Vec::new()
    }
}
