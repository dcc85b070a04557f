use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, s};
use rayon::prelude::*;

use crate::beams::StepAttentions;
use crate::common::GenerationConfig;
use crate::error::{GenerationError, GenerationResult};

fn alignment_error(msg: impl Into<String>) -> GenerationError {
    GenerationError::Alignment(msg.into())
}

/// Token-level timestamps from the cross-attentions of the alignment heads.
#[derive(Debug, Clone)]
pub struct TimestampAligner {
    alignment_heads: Vec<(usize, usize)>,
    median_filter_width: usize,
    time_precision: f32,
}

impl TimestampAligner {
    pub fn new(alignment_heads: Vec<(usize, usize)>, median_filter_width: usize, time_precision: f32) -> Self {
        Self {
            alignment_heads,
            median_filter_width,
            time_precision,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> GenerationResult<Self> {
        let heads = config
            .alignment_heads
            .clone()
            .filter(|heads| !heads.is_empty())
            .ok_or_else(|| GenerationError::config("token timestamps require alignment_heads"))?;
        Ok(Self::new(heads, config.median_filter_width, config.time_precision))
    }

    /// Stacks the alignment heads over every step into `[heads, tokens, frames]`,
    /// keeping the first `num_frames / 2` encoder frames.
    fn collect_heads(
        &self,
        cross_attentions: &[StepAttentions],
        num_frames: Option<usize>,
    ) -> GenerationResult<Array3<f32>> {
        if self.alignment_heads.is_empty() {
            return Err(alignment_error("no alignment heads"));
        }
        let first = cross_attentions
            .first()
            .ok_or_else(|| alignment_error("no cross attentions were recorded"))?;
        let (first_layer, _) = self.alignment_heads[0];
        let frames = first
            .get(first_layer)
            .map(|a| a.shape()[3])
            .ok_or_else(|| alignment_error(format!("layer {} out of range", first_layer)))?;
        let keep = num_frames.map(|n| (n / 2).min(frames)).unwrap_or(frames);
        if keep == 0 {
            return Err(alignment_error("no encoder frames to align against"));
        }

        let tokens: usize = cross_attentions
            .iter()
            .map(|step| step.get(first_layer).map(|a| a.shape()[2]).unwrap_or(0))
            .sum();
        let mut weights = Array3::<f32>::zeros((self.alignment_heads.len(), tokens, keep));

        for (idx, &(layer, head)) in self.alignment_heads.iter().enumerate() {
            let mut offset = 0;
            for (step, attentions) in cross_attentions.iter().enumerate() {
                let att = attentions.get(layer).ok_or_else(|| {
                    alignment_error(format!("step {} has no layer {}", step, layer))
                })?;
                let shape = att.shape();
                if head >= shape[1] {
                    return Err(alignment_error(format!(
                        "head {} out of range for layer {} with {} heads",
                        head, layer, shape[1]
                    )));
                }
                if shape[3] < keep || offset + shape[2] > tokens {
                    return Err(alignment_error(format!(
                        "step {} attention shape {:?} is inconsistent with earlier steps",
                        step, shape
                    )));
                }
                weights
                    .slice_mut(s![idx, offset..offset + shape[2], ..])
                    .assign(&att.slice(s![0, head, .., ..keep]));
                offset += shape[2];
            }
            if offset != tokens {
                return Err(alignment_error(format!(
                    "layer {} covers {} tokens, expected {}",
                    layer, offset, tokens
                )));
            }
        }
        Ok(weights)
    }

    /// The `[tokens, frames]` matrix fed to DTW: each head standardized per
    /// frame across tokens, median filtered along frames, then averaged.
    pub fn alignment_matrix(
        &self,
        cross_attentions: &[StepAttentions],
        num_frames: Option<usize>,
    ) -> GenerationResult<Array2<f32>> {
        if self.median_filter_width % 2 == 0 {
            return Err(alignment_error(format!(
                "median filter width must be odd, got {}",
                self.median_filter_width
            )));
        }
        let mut weights = self.collect_heads(cross_attentions, num_frames)?;
        let width = self.median_filter_width;

        weights
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut head| {
                for mut column in head.axis_iter_mut(Axis(1)) {
                    let n = column.len() as f32;
                    let mean = column.sum() / n;
                    let var = column.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / n;
                    let std = var.sqrt();
                    let scale = if std > 0.0 { std } else { 1.0 };
                    column.mapv_inplace(|x| (x - mean) / scale);
                }
                for mut row in head.axis_iter_mut(Axis(0)) {
                    let filtered = median_filter(row.view(), width);
                    row.assign(&filtered);
                }
            });

        weights
            .mean_axis(Axis(0))
            .ok_or_else(|| alignment_error("no alignment heads"))
    }

    /// One timestamp in seconds per position of a `sequence_len` long
    /// sequence whose decoder steps produced `cross_attentions`.
    ///
    /// The first position is 0. Every later position gets the time of the
    /// frame where the warping path reaches the preceding token. Values
    /// never decrease and stay within `[0, num_frames * time_precision]`.
    pub fn extract_token_timestamps(
        &self,
        cross_attentions: &[StepAttentions],
        sequence_len: usize,
        num_frames: Option<usize>,
    ) -> GenerationResult<Vec<f32>> {
        let matrix = self.alignment_matrix(cross_attentions, num_frames)?;
        let upper = num_frames.unwrap_or(matrix.ncols()) as f32 * self.time_precision;

        let cost = matrix.mapv(|x| -(x as f64));
        let (text_indices, time_indices) = dynamic_time_warping(cost.view());

        let mut timestamps = Vec::with_capacity(sequence_len);
        timestamps.push(0.0f32);
        let mut previous: Option<usize> = None;
        for (&text, &time) in text_indices.iter().zip(&time_indices) {
            if previous != Some(text) {
                timestamps.push(time as f32 * self.time_precision);
                previous = Some(text);
            }
        }

        let last = timestamps.last().copied().unwrap_or(0.0);
        timestamps.resize(sequence_len, last);
        let mut running = 0.0f32;
        for t in timestamps.iter_mut() {
            running = running.max(t.clamp(0.0, upper));
            *t = running;
        }
        Ok(timestamps)
    }
}

/// Sliding median of odd `width` with reflect padding. Inputs no longer
/// than `width / 2` are returned unchanged.
pub fn median_filter(values: ArrayView1<'_, f32>, width: usize) -> Array1<f32> {
    let n = values.len();
    let pad = width / 2;
    if width <= 1 || n <= pad {
        return values.to_owned();
    }

    let reflect = |j: isize| -> usize {
        let last = n as isize - 1;
        let r = if j < 0 {
            -j
        } else if j > last {
            2 * last - j
        } else {
            j
        };
        r as usize
    };

    let mut window = vec![0.0f32; width];
    Array1::from_shape_fn(n, |i| {
        for (k, slot) in window.iter_mut().enumerate() {
            *slot = values[reflect(i as isize + k as isize - pad as isize)];
        }
        window.sort_by(|a, b| a.total_cmp(b));
        window[pad]
    })
}

/// Minimal-cost monotonic path through `cost` (`[tokens, frames]`).
///
/// Returns the token and frame index of every step of the path, from
/// `(0, 0)` to the bottom-right corner. On equal costs the path prefers
/// advancing in time.
pub fn dynamic_time_warping(cost: ArrayView2<'_, f64>) -> (Vec<usize>, Vec<usize>) {
    let (rows, cols) = cost.dim();
    if rows == 0 || cols == 0 {
        return (Vec::new(), Vec::new());
    }

    let mut acc = Array2::<f64>::from_elem((rows + 1, cols + 1), f64::INFINITY);
    let mut trace = Array2::<i8>::from_elem((rows + 1, cols + 1), -1);
    acc[[0, 0]] = 0.0;

    for j in 1..=cols {
        for i in 1..=rows {
            let c0 = acc[[i - 1, j - 1]];
            let c1 = acc[[i - 1, j]];
            let c2 = acc[[i, j - 1]];
            let (c, t) = if c0 < c1 && c0 < c2 {
                (c0, 0)
            } else if c1 < c0 && c1 < c2 {
                (c1, 1)
            } else {
                (c2, 2)
            };
            acc[[i, j]] = cost[[i - 1, j - 1]] + c;
            trace[[i, j]] = t;
        }
    }

    trace.row_mut(0).fill(2);
    trace.column_mut(0).fill(1);

    let (mut i, mut j) = (rows, cols);
    let mut text_indices = Vec::with_capacity(rows + cols);
    let mut time_indices = Vec::with_capacity(rows + cols);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 {
            text_indices.push(i - 1);
            time_indices.push(j - 1);
        }
        match trace[[i, j]] {
            0 => {
                i -= 1;
                j -= 1;
            }
            1 => i -= 1,
            _ => j -= 1,
        }
    }
    text_indices.reverse();
    time_indices.reverse();
    (text_indices, time_indices)
}
