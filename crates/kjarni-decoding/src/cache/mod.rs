//! Key/value cache state and its per-beam bookkeeping.

mod manager;

pub use manager::CacheManager;

use anyhow::{Result, bail};
use ndarray::{Array4, Axis};
use rayon::prelude::*;

/// Shape of the cache a model expects, used to synthesize empty state on
/// the first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

/// Batched per-layer `(key, value)` tensors, each
/// `[batch, heads, seq, head_dim]`.
///
/// The engine never looks inside; it only gathers rows along the batch
/// axis when beams are pruned or duplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct PastKeyValues {
    layers: Vec<(Array4<f32>, Array4<f32>)>,
    batch_size: usize,
}

impl PastKeyValues {
    pub fn new(layers: Vec<(Array4<f32>, Array4<f32>)>, batch_size: usize) -> Result<Self> {
        for (idx, (k, v)) in layers.iter().enumerate() {
            if k.shape()[0] != batch_size || v.shape()[0] != batch_size {
                bail!(
                    "layer {} batch mismatch: key {:?}, value {:?}, expected batch {}",
                    idx,
                    k.shape(),
                    v.shape(),
                    batch_size
                );
            }
        }
        Ok(Self { layers, batch_size })
    }

    /// Zero-length cache for `batch_size` rows.
    pub fn empty(layout: &CacheLayout, batch_size: usize) -> Self {
        let shape = (batch_size, layout.num_heads, 0, layout.head_dim);
        let layers = (0..layout.num_layers)
            .map(|_| (Array4::zeros(shape), Array4::zeros(shape)))
            .collect();
        Self { layers, batch_size }
    }

    pub fn layers(&self) -> &[(Array4<f32>, Array4<f32>)] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [(Array4<f32>, Array4<f32>)] {
        &mut self.layers
    }

    pub fn into_layers(self) -> Vec<(Array4<f32>, Array4<f32>)> {
        self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Cached positions per row.
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|(k, _)| k.shape()[2]).unwrap_or(0)
    }

    /// Gathers rows `indices` into a new cache. Rows may repeat.
    pub fn select_beams(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.batch_size) {
            bail!(
                "beam index {} out of bounds for cache with {} rows",
                bad,
                self.batch_size
            );
        }

        let layers = self
            .layers
            .par_iter()
            .map(|(k, v)| (k.select(Axis(0), indices), v.select(Axis(0), indices)))
            .collect();

        Ok(Self {
            layers,
            batch_size: indices.len(),
        })
    }
}

#[cfg(test)]
mod tests;
