//! Autoregressive decoding for transformer language models
//!
//! This crate drives the token-by-token loop on top of a model's single-step
//! compute: config resolution, logits processing, greedy, sampling and beam
//! search strategies, per-beam cache bookkeeping, and Whisper timestamp
//! decoding. Models plug in through [`traits::StepModel`].

pub mod beams;
pub mod cache;
pub mod common;
pub mod error;
pub mod generation;
pub mod generator;
pub mod models;
pub mod processors;
pub mod sampling;
pub mod traits;

pub use common::{
    CancellationHandle, CancellationToken, DecodingStrategy, EarlyStopping, GenerationConfig,
    TokenIds,
};
pub use error::{GenerationError, GenerationResult};
pub use generation::{GenerationOverrides, ResolvedGenerationConfig, resolve_generation_config};
pub use generator::{
    DecodeSession, GenerateDictOutput, GenerateOptions, GenerationOutput, Generator,
};
pub use models::{ModelFamily, ModelRegistry};
pub use processors::{LogitsProcessor, LogitsProcessorList};
pub use sampling::Sampler;
pub use traits::{ModelSpec, StepInput, StepModel, StepOutput};

pub mod prelude {
    pub use crate::cache::{CacheLayout, PastKeyValues};
    pub use crate::generation::GenerationOverrides;
    pub use crate::generator::{GenerateOptions, Generator};
    pub use crate::traits::{ModelSpec, StepInput, StepModel, StepOutput};
}
