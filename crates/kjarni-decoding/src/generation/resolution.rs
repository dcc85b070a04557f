//! Generation configuration resolution.
//!
//! Merges base defaults, the model's declared config and call-site
//! overrides into a fully resolved configuration.

use super::overrides::GenerationOverrides;
use super::resolved::ResolvedGenerationConfig;
use crate::common::GenerationConfig;

/// Merge the three configuration tiers.
///
/// # Precedence (highest to lowest)
///
/// 1. Call-site overrides
/// 2. Model-declared config
/// 3. Base defaults
///
/// Each field is taken from the highest tier that sets it. A set field
/// replaces the lower value as a whole.
///
/// # Example
///
/// ```ignore
/// let declared = GenerationOverrides::from_json_file("generation_config.json")?;
/// let call = GenerationOverrides { num_beams: Some(4), ..Default::default() };
///
/// let resolved = resolve_generation_config(GenerationConfig::default(), &declared, &call);
/// resolved.validate()?;
/// ```
pub fn resolve_generation_config(
    base: GenerationConfig,
    model_declared: &GenerationOverrides,
    call_site: &GenerationOverrides,
) -> ResolvedGenerationConfig {
    let mut config = base;
    model_declared.apply_to(&mut config);
    call_site.apply_to(&mut config);

    log::trace!("Resolved generation config: {:?}", config);

    ResolvedGenerationConfig::new(config)
}
