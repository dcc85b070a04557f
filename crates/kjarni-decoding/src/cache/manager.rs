use std::collections::HashMap;

use ndarray::Axis;

use super::{CacheLayout, PastKeyValues};
use crate::beams::BeamId;
use crate::error::{GenerationError, GenerationResult};

/// Maps stable beam identities to rows of one batched cache.
///
/// Row `i` of [`CacheManager::state`] belongs to `order()[i]`. Forks are
/// queued and resolved by a single gather in [`CacheManager::commit`], so a
/// surviving beam always receives its parent's rows regardless of slot.
#[derive(Debug)]
pub struct CacheManager {
    layout: CacheLayout,
    state: PastKeyValues,
    order: Vec<BeamId>,
    rows: HashMap<BeamId, usize>,
    pending: Vec<(BeamId, BeamId)>,
}

impl CacheManager {
    pub fn new(layout: CacheLayout) -> Self {
        Self {
            layout,
            state: PastKeyValues::empty(&layout, 0),
            order: Vec::new(),
            rows: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Starts fresh rows for `beams` with synthesized zero-length tensors.
    pub fn register(&mut self, beams: &[BeamId]) {
        self.state = PastKeyValues::empty(&self.layout, beams.len());
        self.set_order(beams.to_vec());
        self.pending.clear();
    }

    /// The batched cache, rows in [`CacheManager::order`].
    pub fn state(&self) -> &PastKeyValues {
        &self.state
    }

    pub fn order(&self) -> &[BeamId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, beam: BeamId) -> bool {
        self.rows.contains_key(&beam)
    }

    fn row_of(&self, beam: BeamId) -> GenerationResult<usize> {
        self.rows
            .get(&beam)
            .copied()
            .ok_or_else(|| GenerationError::cache(format!("no cache row for beam {}", beam)))
    }

    fn set_order(&mut self, order: Vec<BeamId>) {
        self.rows = order.iter().enumerate().map(|(row, &beam)| (beam, row)).collect();
        self.order = order;
    }

    /// A single-row copy of `beam`'s cache.
    pub fn get(&self, beam: BeamId) -> GenerationResult<PastKeyValues> {
        let row = self.row_of(beam)?;
        self.state
            .select_beams(&[row])
            .map_err(|e| GenerationError::cache(e.to_string()))
    }

    /// Overwrites `beam`'s row with a single-row cache of matching shape.
    pub fn set(&mut self, beam: BeamId, state: PastKeyValues) -> GenerationResult<()> {
        let row = self.row_of(beam)?;
        if state.batch_size() != 1 {
            return Err(GenerationError::cache(format!(
                "expected a single-row cache for beam {}, got {} rows",
                beam,
                state.batch_size()
            )));
        }
        if self.order.len() == 1 {
            self.state = state;
            return Ok(());
        }
        if state.num_layers() != self.state.num_layers() {
            return Err(GenerationError::cache(format!(
                "layer count mismatch: {} vs {}",
                state.num_layers(),
                self.state.num_layers()
            )));
        }
        for ((dst_k, dst_v), (src_k, src_v)) in
            self.state.layers_mut().iter_mut().zip(state.layers())
        {
            if dst_k.shape()[1..] != src_k.shape()[1..] || dst_v.shape()[1..] != src_v.shape()[1..] {
                return Err(GenerationError::cache(format!(
                    "row shape mismatch for beam {}: {:?} vs {:?}",
                    beam,
                    &dst_k.shape()[1..],
                    &src_k.shape()[1..]
                )));
            }
            dst_k.index_axis_mut(Axis(0), row).assign(&src_k.index_axis(Axis(0), 0));
            dst_v.index_axis_mut(Axis(0), row).assign(&src_v.index_axis(Axis(0), 0));
        }
        Ok(())
    }

    /// Replaces the whole batched cache after a compute step. Rows must
    /// follow the current order.
    pub fn set_batched(&mut self, state: PastKeyValues) -> GenerationResult<()> {
        if state.batch_size() != self.order.len() {
            return Err(GenerationError::cache(format!(
                "compute returned a cache with {} rows for {} beams",
                state.batch_size(),
                self.order.len()
            )));
        }
        self.state = state;
        Ok(())
    }

    /// Queues `child` to inherit `parent`'s rows at the next commit.
    pub fn fork(&mut self, parent: BeamId, child: BeamId) -> GenerationResult<()> {
        self.row_of(parent)?;
        self.pending.push((child, parent));
        Ok(())
    }

    /// Drops `beam`: cancels a queued fork for it, or removes its row.
    pub fn release(&mut self, beam: BeamId) -> GenerationResult<()> {
        let before = self.pending.len();
        self.pending.retain(|&(child, _)| child != beam);
        if self.pending.len() != before {
            return Ok(());
        }

        if let Some(row) = self.rows.get(&beam).copied() {
            let keep: Vec<usize> = (0..self.order.len()).filter(|&r| r != row).collect();
            self.state = self
                .state
                .select_beams(&keep)
                .map_err(|e| GenerationError::cache(e.to_string()))?;
            let order = keep.iter().map(|&r| self.order[r]).collect();
            self.set_order(order);
        }
        Ok(())
    }

    /// Resolves queued forks with one gather. Beams that were not forked
    /// lose their rows.
    pub fn commit(&mut self) -> GenerationResult<()> {
        let pending = std::mem::take(&mut self.pending);
        let parents = pending
            .iter()
            .map(|&(_, parent)| self.row_of(parent))
            .collect::<GenerationResult<Vec<usize>>>()?;

        self.state = self
            .state
            .select_beams(&parents)
            .map_err(|e| GenerationError::cache(e.to_string()))?;
        self.set_order(pending.into_iter().map(|(child, _)| child).collect());
        Ok(())
    }
}
