//! Chunked evaluation of a [`SeparationModel`] over arbitrarily long audio.
//!
//! The input is cut into segments of the model's length, each segment is
//! evaluated on its own, and the outputs are blended back together with a
//! triangular weight. Optional shift ensembling evaluates circularly rotated
//! copies of the input and averages the realigned results.

use ndarray::{concatenate, s, Array, Array2, Array3, ArrayView, ArrayView1, ArrayView2, Axis, RemoveAxis, Slice, Zip};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    core::{dsp::triangular_weight, engine::SeparationModel},
    error::{Result, SeparationError},
    io::progress::emit_chunks,
    types::{Stem, StemSet, Waveform},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparateOptions {
    /// Fraction of each segment shared with its neighbour, in `[0, 1)`.
    pub overlap: f32,
    /// Number of shifted passes to average. `1` is a plain single pass.
    pub shifts: usize,
    /// Seed for the shift offsets.
    pub seed: u64,
    /// Upper bound on separation buffers, in bytes.
    pub max_buffer_bytes: Option<u64>,
    /// Exponent applied to the triangular blending weight.
    pub transition_power: f32,
}

impl Default for SeparateOptions {
    fn default() -> Self {
        Self {
            overlap: 0.25,
            shifts: 1,
            seed: 0,
            max_buffer_bytes: None,
            transition_power: 1.0,
        }
    }
}

impl SeparateOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(SeparationError::InvalidConfig(format!(
                "overlap must be in [0, 1), got {}",
                self.overlap
            )));
        }
        if self.shifts == 0 {
            return Err(SeparationError::InvalidConfig(
                "shifts must be at least 1".into(),
            ));
        }
        if !(self.transition_power > 0.0) {
            return Err(SeparationError::InvalidConfig(format!(
                "transition power must be positive, got {}",
                self.transition_power
            )));
        }
        Ok(())
    }

    /// Distance between consecutive segment starts.
    pub fn stride(&self, segment: usize) -> usize {
        ((1.0 - self.overlap) * segment as f32).round().max(1.0) as usize
    }
}

/// Separate `input` into the model's stems, in model order.
///
/// Stems keep the input's sample rate, channel count and length.
pub fn separate(model: &dyn SeparationModel, input: &Waveform, opts: &SeparateOptions) -> Result<StemSet> {
    let mix = prepare(model, input, opts)?;
    let out = if opts.shifts == 1 {
        let mut progress = Progress::new(segment_count(model, &mix, opts));
        single_pass(model, mix.view(), opts, &mut progress)?
    } else {
        shift_ensemble(model, mix.view(), input.sample_rate(), opts)?
    };
    into_stems(model, input, out)
}

/// One blended pass over `input`, ignoring `opts.shifts`.
pub fn separate_once(model: &dyn SeparationModel, input: &Waveform, opts: &SeparateOptions) -> Result<StemSet> {
    let mix = prepare(model, input, opts)?;
    let mut progress = Progress::new(segment_count(model, &mix, opts));
    let out = single_pass(model, mix.view(), opts, &mut progress)?;
    into_stems(model, input, out)
}

/// Peak buffer footprint of a separation run, in bytes.
pub fn estimate_buffer_bytes(
    stems: usize,
    channels: usize,
    frames: usize,
    segment: usize,
    shifts: usize,
) -> u64 {
    let stems = stems as u128;
    let channels = channels as u128;
    let frames = frames as u128;
    let segment = segment as u128;
    let workers = rayon::current_num_threads().max(1) as u128;

    // accumulators + weight sum
    let mut floats = stems * channels * frames + frames;
    if shifts > 1 {
        // running sum + rotated input
        floats += stems * channels * frames + channels * frames;
    }
    // segments in flight
    floats += workers * (stems + 1) * channels * segment;

    u64::try_from(floats * 4).unwrap_or(u64::MAX)
}

/// Validate options and shapes, and bring the input into the model's channel layout.
fn prepare(model: &dyn SeparationModel, input: &Waveform, opts: &SeparateOptions) -> Result<Array2<f32>> {
    opts.validate()?;

    if input.sample_rate() != model.sample_rate() {
        return Err(SeparationError::Inference(format!(
            "input is {} Hz but model `{}` expects {} Hz",
            input.sample_rate(),
            model.name(),
            model.sample_rate()
        )));
    }
    if input.frames() == 0 {
        return Err(SeparationError::Inference("cannot separate an empty waveform".into()));
    }
    if model.segment_length() == 0 || model.stems().is_empty() {
        return Err(SeparationError::Inference(format!(
            "model `{}` reports no segment length or stems",
            model.name()
        )));
    }

    let estimate = estimate_buffer_bytes(
        model.stems().len(),
        model.channels(),
        input.frames(),
        model.segment_length(),
        opts.shifts,
    );
    if let Some(limit) = opts.max_buffer_bytes {
        if estimate > limit {
            return Err(SeparationError::ResourceExhausted(format!(
                "{:.1}s of audio needs ~{} bytes of buffers, limit is {}",
                input.duration_secs(),
                estimate,
                limit
            )));
        }
    }

    to_model_layout(input.samples(), model.channels())
}

fn to_model_layout(samples: ArrayView2<'_, f32>, model_channels: usize) -> Result<Array2<f32>> {
    let (channels, frames) = samples.dim();
    if channels == model_channels {
        return Ok(samples.to_owned());
    }
    if channels == 1 {
        return samples
            .broadcast((model_channels, frames))
            .map(|v| v.to_owned())
            .ok_or_else(|| SeparationError::Inference("cannot widen mono input".into()));
    }
    if model_channels == 1 {
        return samples
            .mean_axis(Axis(0))
            .map(|m| m.insert_axis(Axis(0)))
            .ok_or_else(|| SeparationError::Inference("cannot downmix input".into()));
    }
    Err(SeparationError::Inference(format!(
        "model takes {model_channels} channels, input has {channels}"
    )))
}

/// `[stems, model channels, frames]` back to named stems with the input's channel count.
fn into_stems(model: &dyn SeparationModel, input: &Waveform, out: Array3<f32>) -> Result<StemSet> {
    let out = if out.len_of(Axis(1)) == input.channel_count() {
        out
    } else if input.channel_count() == 1 {
        out.mean_axis(Axis(1))
            .map(|m| m.insert_axis(Axis(1)))
            .ok_or_else(|| SeparationError::Inference("cannot fold stems to mono".into()))?
    } else if out.len_of(Axis(1)) == 1 {
        let (stems, _, frames) = out.dim();
        out.broadcast((stems, input.channel_count(), frames))
            .map(|v| v.to_owned())
            .ok_or_else(|| SeparationError::Inference("cannot widen mono stems".into()))?
    } else {
        return Err(SeparationError::Inference(format!(
            "stems have {} channels, input has {}",
            out.len_of(Axis(1)),
            input.channel_count()
        )));
    };

    let stems = model
        .stems()
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            Ok(Stem {
                name: name.clone(),
                waveform: Waveform::new(out.index_axis(Axis(0), idx).to_owned(), input.sample_rate())?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    StemSet::new(stems)
}

fn segment_count(model: &dyn SeparationModel, mix: &Array2<f32>, opts: &SeparateOptions) -> usize {
    let frames = mix.ncols();
    frames.div_ceil(opts.stride(model.segment_length()))
}

struct Progress {
    done: usize,
    total: usize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self { done: 0, total }
    }

    fn advance(&mut self, n: usize) {
        self.done += n;
        emit_chunks(self.done, self.total);
    }
}

fn zeroed(len: usize, what: &str) -> Result<Vec<f32>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| SeparationError::ResourceExhausted(format!("{what} ({len} samples): {e}")))?;
    v.resize(len, 0.0);
    Ok(v)
}

fn single_pass(
    model: &dyn SeparationModel,
    mix: ArrayView2<'_, f32>,
    opts: &SeparateOptions,
    progress: &mut Progress,
) -> Result<Array3<f32>> {
    let (channels, frames) = mix.dim();
    let segment = model.segment_length();
    let stems = model.stems().len();
    let stride = opts.stride(segment);
    let weight = triangular_weight(segment, opts.transition_power);

    let acc_len = stems
        .checked_mul(channels)
        .and_then(|n| n.checked_mul(frames))
        .ok_or_else(|| SeparationError::ResourceExhausted("stem buffer size overflows".into()))?;
    let mut acc = Array3::from_shape_vec((stems, channels, frames), zeroed(acc_len, "stem accumulator")?)
        .map_err(|e| SeparationError::Inference(e.to_string()))?;
    let mut weight_sum = zeroed(frames, "weight accumulator")?;

    let starts: Vec<usize> = (0..frames).step_by(stride).collect();
    let batch = rayon::current_num_threads().max(1);
    debug!(frames, segment, stride, segments = starts.len(), "blending pass");

    for group in starts.chunks(batch) {
        let outputs: Vec<Result<ndarray::Array4<f32>>> = group
            .par_iter()
            .map(|&start| {
                let len = segment.min(frames - start);
                let mut chunk = Array3::<f32>::zeros((1, channels, segment));
                chunk
                    .slice_mut(s![0, .., ..len])
                    .assign(&mix.slice(s![.., start..start + len]));
                let out = model.apply(chunk.view())?;
                if out.dim() != (1, stems, channels, segment) {
                    return Err(SeparationError::Inference(format!(
                        "model returned {:?}, expected [1, {stems}, {channels}, {segment}]",
                        out.shape()
                    )));
                }
                Ok(out)
            })
            .collect();

        // Accumulate in segment order so the sum does not depend on scheduling.
        for (&start, out) in group.iter().zip(outputs) {
            let out = out?;
            let len = segment.min(frames - start);
            let w = ArrayView1::from(&weight[..len]);
            for st in 0..stems {
                for ch in 0..channels {
                    Zip::from(acc.slice_mut(s![st, ch, start..start + len]))
                        .and(out.slice(s![0, st, ch, ..len]))
                        .and(&w)
                        .for_each(|a, &x, &wt| *a += x * wt);
                }
            }
            for (sum, &w) in weight_sum[start..start + len].iter_mut().zip(&weight[..len]) {
                *sum += w;
            }
        }
        progress.advance(group.len());
    }

    for mut lane in acc.lanes_mut(Axis(2)) {
        for (v, &w) in lane.iter_mut().zip(&weight_sum) {
            if w > 0.0 {
                *v /= w;
            }
        }
    }
    Ok(acc)
}

/// Circularly rotate along the last axis: `out[i] = a[(i + k) % n]`.
fn rotate<D: RemoveAxis>(a: ArrayView<'_, f32, D>, k: usize) -> Result<Array<f32, D>> {
    let axis = Axis(a.ndim() - 1);
    let n = a.len_of(axis);
    let k = if n == 0 { 0 } else { k % n };
    concatenate(
        axis,
        &[
            a.slice_axis(axis, Slice::from(k..)),
            a.slice_axis(axis, Slice::from(..k)),
        ],
    )
    .map_err(|e| SeparationError::Inference(format!("rotate: {e}")))
}

/// Offsets for each shifted pass, in `[0, min(sample_rate / 2, frames - 1)]`.
pub fn shift_offsets(seed: u64, shifts: usize, sample_rate: u32, frames: usize) -> Vec<usize> {
    let max_shift = ((sample_rate / 2) as usize).min(frames.saturating_sub(1));
    let mut rng = StdRng::seed_from_u64(seed);
    (0..shifts).map(|_| rng.random_range(0..=max_shift)).collect()
}

fn shift_ensemble(
    model: &dyn SeparationModel,
    mix: ArrayView2<'_, f32>,
    sample_rate: u32,
    opts: &SeparateOptions,
) -> Result<Array3<f32>> {
    let frames = mix.ncols();
    let offsets = shift_offsets(opts.seed, opts.shifts, sample_rate, frames);
    let per_pass = frames.div_ceil(opts.stride(model.segment_length()));
    let mut progress = Progress::new(per_pass * offsets.len());
    info!(shifts = opts.shifts, ?offsets, "shift ensemble");

    let mut sum: Option<Array3<f32>> = None;
    for &offset in &offsets {
        let rotated = rotate(mix, offset)?;
        let out = single_pass(model, rotated.view(), opts, &mut progress)?;
        let aligned = rotate(out.view(), frames - offset % frames)?;
        match sum.as_mut() {
            Some(total) => *total += &aligned,
            None => sum = Some(aligned),
        }
    }

    let mut total = sum.ok_or_else(|| SeparationError::InvalidConfig("no shift passes".into()))?;
    total /= opts.shifts as f32;
    Ok(total)
}
