use num_complex::Complex32;
use once_cell::sync::Lazy;
use rustfft::{num_traits::Zero, Fft, FftPlanner};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

struct FftCache {
    fft_forward: Arc<dyn Fft<f32>>,
    hann_window: Vec<f32>,
}

static FFT_CACHE: Lazy<Mutex<HashMap<usize, Arc<FftCache>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn fft_cache(n_fft: usize) -> Arc<FftCache> {
    let mut caches = FFT_CACHE.lock().unwrap_or_else(PoisonError::into_inner);
    caches
        .entry(n_fft)
        .or_insert_with(|| {
            let mut planner = FftPlanner::new();
            Arc::new(FftCache {
                fft_forward: planner.plan_fft_forward(n_fft),
                hann_window: hann(n_fft),
            })
        })
        .clone()
}

/// Symmetric Hann window.
pub fn hann(n_fft: usize) -> Vec<f32> {
    if n_fft <= 1 {
        return vec![1.0];
    }
    let denom = (n_fft - 1) as f32;
    (0..n_fft)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * (i as f32) / denom).cos())
        .collect()
}

/// Triangular overlap-add weight of `len` samples peaking at 1.0.
/// Every entry stays strictly positive, whatever the power.
pub fn triangular_weight(len: usize, power: f32) -> Vec<f32> {
    if len == 0 {
        return Vec::new();
    }
    let peak = ((len + 1) / 2) as f32;
    (0..len)
        .map(|i| {
            let w = (i + 1).min(len - i) as f32 / peak;
            if power == 1.0 {
                w
            } else {
                w.powf(power).max(f32::MIN_POSITIVE)
            }
        })
        .collect()
}

/// Complex-as-channels spectrogram for stereo with center padding.
///
/// Layout is `[4, F, Frames]` flattened, channel order `L.re, L.im, R.re, R.im`,
/// with `F = n_fft / 2` and `Frames = 1 + T / hop`.
pub fn stft_cac_stereo_centered(
    left: &[f32],
    right: &[f32],
    n_fft: usize,
    hop: usize,
) -> (Vec<f32>, usize, usize) {
    debug_assert_eq!(left.len(), right.len());
    let cache = fft_cache(n_fft);
    let fft = &cache.fft_forward;
    let window = &cache.hann_window;

    let t = left.len();
    let pad = n_fft / 2;

    let padded_len = pad + t + pad;
    let mut l_sig = vec![0.0f32; padded_len];
    let mut r_sig = vec![0.0f32; padded_len];
    l_sig[pad..pad + t].copy_from_slice(left);
    r_sig[pad..pad + t].copy_from_slice(right);

    let frames = 1 + (t / hop.max(1));
    let f_bins = n_fft / 2;

    let mut out = vec![0.0f32; 4 * f_bins * frames];

    let mut buf_l = vec![Complex32::zero(); n_fft];
    let mut buf_r = vec![Complex32::zero(); n_fft];

    for fr in 0..frames {
        let start = fr * hop;
        for i in 0..n_fft {
            let w = window[i];
            let (l, r) = match start + i {
                idx if idx < padded_len => (l_sig[idx], r_sig[idx]),
                _ => (0.0, 0.0),
            };
            buf_l[i] = Complex32::new(l * w, 0.0);
            buf_r[i] = Complex32::new(r * w, 0.0);
        }

        fft.process(&mut buf_l);
        fft.process(&mut buf_r);

        let plane = f_bins * frames;
        for fi in 0..f_bins {
            let base = fi * frames + fr;
            out[base] = buf_l[fi].re;
            out[plane + base] = buf_l[fi].im;
            out[2 * plane + base] = buf_r[fi].re;
            out[3 * plane + base] = buf_r[fi].im;
        }
    }

    (out, f_bins, frames)
}
