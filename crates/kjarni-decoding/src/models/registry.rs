//! Registry from `model_type` to [`ModelFamily`].

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;

use super::whisper::WhisperFamily;
use super::{GenericFamily, ModelFamily};

/// Text model types that decode with the generic rules.
const GENERIC_MODEL_TYPES: &[&str] = &[
    "gpt2", "llama", "mistral", "qwen2", "phi3", "bart", "t5", "marian",
];

static GLOBAL_REGISTRY: Lazy<ModelRegistry> = Lazy::new(ModelRegistry::builtin);

/// Maps `model_type` strings, as found in a model's `config.json`, to the
/// family that knows how to decode it.
#[derive(Clone)]
pub struct ModelRegistry {
    families: HashMap<String, Arc<dyn ModelFamily>>,
    fallback: Arc<dyn ModelFamily>,
}

impl ModelRegistry {
    /// An empty registry. Every lookup resolves to the generic family.
    pub fn new() -> Self {
        Self {
            families: HashMap::new(),
            fallback: Arc::new(GenericFamily),
        }
    }

    /// Registry with every built-in model type.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let generic: Arc<dyn ModelFamily> = Arc::new(GenericFamily);
        for model_type in GENERIC_MODEL_TYPES {
            registry.register(*model_type, generic.clone());
        }
        registry.register("whisper", Arc::new(WhisperFamily));
        registry
    }

    /// The process-wide built-in registry, initialized on first use.
    pub fn global() -> &'static ModelRegistry {
        &GLOBAL_REGISTRY
    }

    /// Adds or replaces the family for `model_type`.
    pub fn register(&mut self, model_type: impl Into<String>, family: Arc<dyn ModelFamily>) {
        let model_type = model_type.into().to_lowercase();
        log::debug!("Registering model type '{}' as {}", model_type, family.name());
        self.families.insert(model_type, family);
    }

    pub fn contains(&self, model_type: &str) -> bool {
        self.families.contains_key(&model_type.to_lowercase())
    }

    /// Family for `model_type`, or the generic family for unknown types.
    pub fn resolve(&self, model_type: &str) -> Arc<dyn ModelFamily> {
        match self.families.get(&model_type.to_lowercase()) {
            Some(family) => family.clone(),
            None => {
                log::debug!("Unknown model type '{}', using generic decoding", model_type);
                self.fallback.clone()
            }
        }
    }

    /// Registered model types, sorted.
    pub fn model_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.families.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("model_types", &self.model_types())
            .finish()
    }
}
