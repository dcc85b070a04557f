//! The `generate` entry points.
//!
//! A [`Generator`] pairs a [`StepModel`] with the [`ModelFamily`] its
//! `model_type` resolves to. Each call resolves the generation config,
//! builds the processor pipeline and sampler once, then drives a
//! [`DecodeSession`] until every beam is finished.
//!
//! # Example
//!
//! ```ignore
//! let generator = Generator::new(Arc::new(model));
//! let options = GenerateOptions {
//!     config: Some(GenerationOverrides::beam_search(4)),
//!     ..Default::default()
//! };
//! let output = generator.generate(&input_ids, options).await?;
//! for seq in output.sequences() {
//!     println!("{:?}", seq);
//! }
//! ```

mod output;
mod session;

pub use output::{GenerateDictOutput, GenerationOutput};
pub use session::DecodeSession;

use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use ndarray::Array2;

use crate::common::{CancellationToken, GenerationConfig};
use crate::error::{GenerationError, GenerationResult};
use crate::generation::{GenerationOverrides, ResolvedGenerationConfig, resolve_generation_config};
use crate::models::{ModelFamily, ModelRegistry};
use crate::processors::{LogitsProcessorList, begin_index, build_logits_processors};
use crate::traits::StepModel;

/// Optional arguments of a generation call.
#[derive(Debug, Default)]
pub struct GenerateOptions {
    /// Call-site overrides, highest priority.
    pub config: Option<GenerationOverrides>,
    /// Extra processors, applied after the built-in pipeline.
    pub logits_processor: Option<LogitsProcessorList>,
    /// `[batch, prompt_len]`. All ones when absent.
    pub attention_mask: Option<Array2<u32>>,
}

impl GenerateOptions {
    pub fn with_config(config: GenerationOverrides) -> Self {
        Self {
            config: Some(config),
            ..Default::default()
        }
    }
}

/// Runs autoregressive decoding against a [`StepModel`].
pub struct Generator {
    model: Arc<dyn StepModel>,
    family: Arc<dyn ModelFamily>,
}

impl Generator {
    /// Resolves the model family through the global registry.
    pub fn new(model: Arc<dyn StepModel>) -> Self {
        Self::with_registry(model, ModelRegistry::global())
    }

    pub fn with_registry(model: Arc<dyn StepModel>, registry: &ModelRegistry) -> Self {
        let family = registry.resolve(&model.spec().model_type);
        Self { model, family }
    }

    pub fn model(&self) -> &Arc<dyn StepModel> {
        &self.model
    }

    pub fn family(&self) -> &dyn ModelFamily {
        self.family.as_ref()
    }

    /// Base defaults, then the model's declared config, then `call_site`.
    pub fn resolve_config(&self, call_site: Option<&GenerationOverrides>) -> ResolvedGenerationConfig {
        let declared = self.model.generation_config();
        let empty = GenerationOverrides::default();
        resolve_generation_config(
            GenerationConfig::default(),
            &declared,
            call_site.unwrap_or(&empty),
        )
    }

    /// Validates the call and prepares its session. No compute happens
    /// here.
    pub fn start(
        &self,
        input_ids: &Array2<u32>,
        options: GenerateOptions,
        token: CancellationToken,
    ) -> GenerationResult<DecodeSession> {
        let (batch_size, prompt_len) = input_ids.dim();
        if batch_size == 0 || prompt_len == 0 {
            return Err(GenerationError::EmptyInput);
        }

        let resolved = self.resolve_config(options.config.as_ref());
        resolved.validate()?;
        let config = resolved.into_inner();

        let max_length = config.effective_max_length(prompt_len);
        let family_processors = self
            .family
            .logits_processors(&config, begin_index(&config, prompt_len));
        let mut processors =
            build_logits_processors(&config, prompt_len, max_length, family_processors);
        if let Some(extra) = options.logits_processor {
            processors.extend(extra);
        }

        DecodeSession::new(
            self.model.clone(),
            config,
            processors,
            input_ids,
            options.attention_mask.as_ref(),
            token,
        )
    }

    /// Decodes `input_ids` (`[batch, prompt_len]`) to completion.
    pub async fn generate(
        &self,
        input_ids: &Array2<u32>,
        options: GenerateOptions,
    ) -> GenerationResult<GenerationOutput> {
        self.generate_cancellable(input_ids, options, CancellationToken::never())
            .await
    }

    /// Like [`Generator::generate`], checking `token` before every step.
    pub async fn generate_cancellable(
        &self,
        input_ids: &Array2<u32>,
        options: GenerateOptions,
        token: CancellationToken,
    ) -> GenerationResult<GenerationOutput> {
        let mut session = self.start(input_ids, options, token)?;
        while session.step().await? {}
        Ok(session.finish())
    }

    /// Yields each generated token of a single sequence as soon as it is
    /// chosen. Requires one input row and `num_beams == 1`.
    pub fn generate_stream<'a>(
        &'a self,
        input_ids: Array2<u32>,
        options: GenerateOptions,
    ) -> impl Stream<Item = GenerationResult<u32>> + 'a {
        try_stream! {
            let mut session = self.start(&input_ids, options, CancellationToken::never())?;
            if session.num_sequences() != 1 || session.config().num_beams != 1 {
                Err::<(), _>(GenerationError::config(
                    "streaming needs one input row, num_beams = 1 and num_return_sequences = 1",
                ))?;
            }

            loop {
                let more = session.step().await?;
                for &token in session.step_tokens() {
                    yield token;
                }
                if !more {
                    break;
                }
            }
        }
    }
}
