use super::*;

use ndarray::{Array4, s};

use crate::beams::BeamId;

fn layout() -> CacheLayout {
    CacheLayout {
        num_layers: 2,
        num_heads: 1,
        head_dim: 2,
    }
}

/// A cache where every element of row `b` equals `b * 10 + layer`.
fn labelled_cache(batch: usize, seq: usize) -> PastKeyValues {
    let layers = (0..2)
        .map(|layer| {
            let mut k = Array4::<f32>::zeros((batch, 1, seq, 2));
            for b in 0..batch {
                k.slice_mut(s![b, .., .., ..]).fill((b * 10 + layer) as f32);
            }
            let v = k.mapv(|x| -x);
            (k, v)
        })
        .collect();
    PastKeyValues::new(layers, batch).unwrap()
}

fn row_label(cache: &PastKeyValues, row: usize) -> f32 {
    cache.layers()[0].0[[row, 0, 0, 0]]
}

fn ids(n: u64) -> Vec<BeamId> {
    (0..n).map(BeamId).collect()
}

// ============================================================================
//  PastKeyValues
// ============================================================================

#[test]
fn test_empty_cache_shape() {
    let cache = PastKeyValues::empty(&layout(), 3);
    assert_eq!(cache.num_layers(), 2);
    assert_eq!(cache.batch_size(), 3);
    assert_eq!(cache.seq_len(), 0);
    assert_eq!(cache.layers()[1].0.shape(), &[3, 1, 0, 2]);
}

#[test]
fn test_new_rejects_batch_mismatch() {
    let k = Array4::<f32>::zeros((2, 1, 1, 2));
    let v = Array4::<f32>::zeros((3, 1, 1, 2));
    assert!(PastKeyValues::new(vec![(k, v)], 2).is_err());
}

#[test]
fn test_select_beams_permutes_and_duplicates() {
    let cache = labelled_cache(4, 3);
    let selected = cache.select_beams(&[2, 2, 0, 1]).unwrap();

    assert_eq!(selected.batch_size(), 4);
    assert_eq!(selected.seq_len(), 3);
    assert_eq!(row_label(&selected, 0), 20.0);
    assert_eq!(row_label(&selected, 1), 20.0);
    assert_eq!(row_label(&selected, 2), 0.0);
    assert_eq!(row_label(&selected, 3), 10.0);
    // second layer and values follow the same rows
    assert_eq!(selected.layers()[1].0[[3, 0, 2, 1]], 11.0);
    assert_eq!(selected.layers()[1].1[[0, 0, 0, 0]], -21.0);
}

#[test]
fn test_select_beams_out_of_bounds() {
    let cache = labelled_cache(2, 1);
    assert!(cache.select_beams(&[0, 2]).is_err());
}

#[test]
fn test_select_subset_of_empty_cache() {
    let cache = PastKeyValues::empty(&layout(), 3);
    let subset = cache.select_beams(&[1]).unwrap();
    assert_eq!(subset.batch_size(), 1);
    assert_eq!(subset.seq_len(), 0);
}

// ============================================================================
//  CacheManager
// ============================================================================

#[test]
fn test_register_synthesizes_empty_rows() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(2));

    assert_eq!(manager.len(), 2);
    assert_eq!(manager.state().batch_size(), 2);
    assert_eq!(manager.state().seq_len(), 0);
    assert_eq!(manager.get(BeamId(1)).unwrap().batch_size(), 1);
}

#[test]
fn test_fork_and_commit_gathers_parent_rows() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(3));
    manager.set_batched(labelled_cache(3, 2)).unwrap();

    // beam 2 survives twice, beam 0 once, beam 1 is pruned
    manager.fork(BeamId(2), BeamId(10)).unwrap();
    manager.fork(BeamId(0), BeamId(11)).unwrap();
    manager.fork(BeamId(2), BeamId(12)).unwrap();
    manager.commit().unwrap();

    assert_eq!(manager.order(), &[BeamId(10), BeamId(11), BeamId(12)]);
    assert!(!manager.contains(BeamId(1)));
    assert_eq!(row_label(&manager.get(BeamId(10)).unwrap(), 0), 20.0);
    assert_eq!(row_label(&manager.get(BeamId(11)).unwrap(), 0), 0.0);
    assert_eq!(row_label(&manager.get(BeamId(12)).unwrap(), 0), 20.0);
}

#[test]
fn test_fork_unknown_parent_fails() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(1));
    assert!(manager.fork(BeamId(7), BeamId(8)).is_err());
}

#[test]
fn test_release_cancels_pending_fork() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(2));
    manager.fork(BeamId(0), BeamId(5)).unwrap();
    manager.fork(BeamId(1), BeamId(6)).unwrap();
    manager.release(BeamId(5)).unwrap();
    manager.commit().unwrap();

    assert_eq!(manager.order(), &[BeamId(6)]);
}

#[test]
fn test_release_drops_live_row() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(3));
    manager.set_batched(labelled_cache(3, 1)).unwrap();

    manager.release(BeamId(1)).unwrap();

    assert_eq!(manager.order(), &[BeamId(0), BeamId(2)]);
    assert_eq!(row_label(&manager.get(BeamId(2)).unwrap(), 0), 20.0);
}

#[test]
fn test_set_overwrites_single_row() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(2));
    manager.set_batched(labelled_cache(2, 1)).unwrap();

    let replacement = labelled_cache(4, 1).select_beams(&[3]).unwrap();
    manager.set(BeamId(0), replacement).unwrap();

    assert_eq!(row_label(manager.state(), 0), 30.0);
    assert_eq!(row_label(manager.state(), 1), 10.0);
}

#[test]
fn test_set_rejects_shape_mismatch() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(2));
    manager.set_batched(labelled_cache(2, 1)).unwrap();

    let longer = labelled_cache(1, 5);
    assert!(manager.set(BeamId(0), longer).is_err());
}

#[test]
fn test_set_batched_requires_matching_rows() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(2));
    assert!(manager.set_batched(labelled_cache(3, 1)).is_err());
}

#[test]
fn test_commit_without_forks_empties_cache() {
    let mut manager = CacheManager::new(layout());
    manager.register(&ids(2));
    manager.commit().unwrap();
    assert!(manager.is_empty());
    assert_eq!(manager.state().batch_size(), 0);
}
